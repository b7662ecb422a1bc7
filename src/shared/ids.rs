use getrandom::getrandom;
use sha2::{Digest, Sha256};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

/// Directory name of a group's namespace. Always a single path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GroupFolder(String);

impl GroupFolder {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_identifier_value("group folder", raw)?;
        if raw == "global" || raw == "errors" {
            return Err(format!("group folder `{raw}` is reserved"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for GroupFolder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .map_err(|err| D::Error::custom(format!("invalid group folder `{raw}`: {err}")))
    }
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    out.into_iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

fn random_suffix() -> String {
    let mut bytes = [0_u8; 4];
    let sample = match getrandom(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE,
        Err(_) => (super::time::now_millis() as u32) % RUN_SUFFIX_SPACE,
    };
    base36_encode_fixed_u32(sample, 4)
}

/// `run-<base36 seconds>-<4 random base36 chars>`.
pub fn generate_run_id(now_secs: i64) -> String {
    let ts = base36_encode_u64(u64::try_from(now_secs).unwrap_or(0));
    format!("run-{ts}-{}", random_suffix())
}

/// Sortable, collision-resistant file stem for queue and IPC files.
pub fn unique_file_stem(now_millis: i64) -> String {
    format!(
        "{:013}-{}",
        u64::try_from(now_millis).unwrap_or(0),
        random_suffix()
    )
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded.
pub fn short_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
}
