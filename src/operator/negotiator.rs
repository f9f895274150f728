use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use tracing::debug;

use crate::controller::Error;
use crate::model::NameCandidate;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 24 random bits, rendered as six hex digits.
pub fn candidate(base: &str) -> NameCandidate {
    let suffix: u32 = rand::thread_rng().gen_range(0..1 << 24);
    NameCandidate {
        base: base.to_string(),
        suffix: format!("{:06x}", suffix),
    }
}

/// Finds a `base-suffix` name that `exists` reports as unused.
///
/// `exists` is called exactly once per attempt and never twice with the same
/// name. Provider errors from the check are returned as-is.
pub async fn reserve<F, Fut>(base: &str, mut exists: F, max_attempts: u32) -> Result<String, Error>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let mut tried: HashSet<String> = HashSet::new();

    for attempt in 1..=max_attempts {
        let mut name = candidate(base).name();
        while tried.contains(&name) {
            name = candidate(base).name();
        }
        tried.insert(name.clone());

        if !exists(name.clone()).await? {
            debug!(name = %name, attempt = attempt, "Reserved name");
            return Ok(name);
        }
        debug!(name = %name, attempt = attempt, "Name taken, regenerating");
    }

    Err(Error::UniquenessExhausted {
        base: base.to_string(),
        attempts: max_attempts,
    })
}
