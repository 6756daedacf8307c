//! RFC 6238 time-based one-time passwords for the broker login flow.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

/// HMAC digest used for code generation. Brokers almost universally use
/// SHA-1; the others exist for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotpAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

/// TOTP generator over a Base32 shared secret.
#[derive(Debug, Clone)]
pub struct Totp {
    secret: Vec<u8>,
    digits: u32,
    period_secs: u64,
    algorithm: TotpAlgorithm,
}

impl Totp {
    /// Standard 6-digit, 30-second, SHA-1 generator.
    pub fn new(secret_base32: &str) -> Result<Self> {
        Self::with_params(secret_base32, 6, 30, TotpAlgorithm::Sha1)
    }

    pub fn with_params(
        secret_base32: &str,
        digits: u32,
        period_secs: u64,
        algorithm: TotpAlgorithm,
    ) -> Result<Self> {
        if !(6..=10).contains(&digits) {
            bail!("totp digits must be between 6 and 10, got {digits}");
        }
        if period_secs == 0 {
            bail!("totp period must be positive");
        }
        let secret = base32_decode(secret_base32).context("invalid base32 totp secret")?;
        if secret.is_empty() {
            bail!("totp secret is empty");
        }
        Ok(Self {
            secret,
            digits,
            period_secs,
            algorithm,
        })
    }

    /// Code for the counter window containing `ts`.
    pub fn code_at(&self, ts: DateTime<Utc>) -> String {
        let secs = ts.timestamp().max(0) as u64;
        self.hotp(secs / self.period_secs)
    }

    /// Code for the current wall-clock window.
    pub fn now(&self) -> String {
        self.code_at(Utc::now())
    }

    /// Accept `code` for the window containing `ts` plus or minus
    /// `window_steps` adjacent windows (clock-skew tolerance).
    pub fn verify(&self, code: &str, ts: DateTime<Utc>, window_steps: u64) -> bool {
        let secs = ts.timestamp().max(0) as u64;
        let counter = secs / self.period_secs;
        if self.hotp(counter) == code {
            return true;
        }
        for w in 1..=window_steps {
            if self.hotp(counter + w) == code {
                return true;
            }
            if counter >= w && self.hotp(counter - w) == code {
                return true;
            }
        }
        false
    }

    /// RFC 4226 HOTP with dynamic truncation.
    fn hotp(&self, counter: u64) -> String {
        let msg = counter.to_be_bytes();
        let mac = match self.algorithm {
            TotpAlgorithm::Sha1 => {
                let mut m = Hmac::<Sha1>::new_from_slice(&self.secret)
                    .expect("hmac accepts any key length");
                m.update(&msg);
                m.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha256 => {
                let mut m = Hmac::<Sha256>::new_from_slice(&self.secret)
                    .expect("hmac accepts any key length");
                m.update(&msg);
                m.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha512 => {
                let mut m = Hmac::<Sha512>::new_from_slice(&self.secret)
                    .expect("hmac accepts any key length");
                m.update(&msg);
                m.finalize().into_bytes().to_vec()
            }
        };

        let offset = (mac[mac.len() - 1] & 0x0f) as usize;
        let bin_code = ((mac[offset] as u32 & 0x7f) << 24)
            | ((mac[offset + 1] as u32) << 16)
            | ((mac[offset + 2] as u32) << 8)
            | (mac[offset + 3] as u32);

        let modulus = 10u64.pow(self.digits);
        format!(
            "{:0width$}",
            bin_code as u64 % modulus,
            width = self.digits as usize
        )
    }
}

/// RFC 4648 Base32 decode. Case-insensitive, whitespace and `=` padding
/// stripped, unpadded input accepted.
fn base32_decode(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8 + 1);
    let mut buffer: u32 = 0;
    let mut bits_left = 0;

    for c in input.chars() {
        if c == '=' || c.is_whitespace() {
            continue;
        }
        let v = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => 26 + (c as u32 - '2' as u32),
            other => bail!("invalid base32 character {other:?}"),
        };
        buffer = (buffer << 5) | v;
        bits_left += 5;
        if bits_left >= 8 {
            bits_left -= 8;
            out.push(((buffer >> bits_left) & 0xff) as u8);
        }
    }
    Ok(out)
}
