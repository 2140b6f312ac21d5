use rand::{Rng, thread_rng};
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

pub const RANDOM_SEED_TOKEN: &str = "rand";
pub const NULL_SEED_TOKEN: &str = "null";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeedError {
    #[error("--seed must be an integer, 'rand', or 'null' (got `{input}`)")]
    Invalid { input: String },
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt cannot be empty")]
    Empty,
    #[error("failed to read prompt from standard input: {0}")]
    Io(#[from] std::io::Error),
}

/// How the generation seed is chosen for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Draw a fresh uniformly distributed `u64`.
    Random,
    /// Send `null` and let the API pick.
    Null,
    Fixed(u64),
}

impl SeedPolicy {
    /// Resolves the policy into the value sent with the request.
    pub fn resolve(self) -> Option<u64> {
        self.resolve_with(&mut thread_rng())
    }

    pub fn resolve_with<R: Rng + ?Sized>(self, rng: &mut R) -> Option<u64> {
        match self {
            SeedPolicy::Random => Some(rng.r#gen::<u64>()),
            SeedPolicy::Null => None,
            SeedPolicy::Fixed(value) => Some(value),
        }
    }
}

impl FromStr for SeedPolicy {
    type Err = SeedError;

    /// Accepts `rand`, `null` (both case-insensitive) or an unsigned integer.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();

        if trimmed.eq_ignore_ascii_case(RANDOM_SEED_TOKEN) {
            return Ok(SeedPolicy::Random);
        }
        if trimmed.eq_ignore_ascii_case(NULL_SEED_TOKEN) {
            return Ok(SeedPolicy::Null);
        }

        trimmed
            .parse::<u64>()
            .map(SeedPolicy::Fixed)
            .map_err(|_| SeedError::Invalid {
                input: input.to_string(),
            })
    }
}

/// Reads the whole prompt from `reader`, trimming surrounding whitespace.
///
/// # Errors
///
/// Returns [`PromptError::Empty`] when nothing but whitespace was read.
pub fn read_prompt<R: Read>(mut reader: R) -> Result<String, PromptError> {
    let mut buffer = String::new();
    reader.read_to_string(&mut buffer)?;

    trimmed_or_none(Some(&buffer))
        .map(str::to_string)
        .ok_or(PromptError::Empty)
}

pub fn trimmed_or_none<'a>(input: Option<&'a str>) -> Option<&'a str> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Cursor;

    #[test]
    fn seed_tokens_are_case_insensitive() {
        assert_eq!("rand".parse::<SeedPolicy>(), Ok(SeedPolicy::Random));
        assert_eq!("RAND".parse::<SeedPolicy>(), Ok(SeedPolicy::Random));
        assert_eq!("Null".parse::<SeedPolicy>(), Ok(SeedPolicy::Null));
        assert_eq!(" null ".parse::<SeedPolicy>(), Ok(SeedPolicy::Null));
    }

    #[test]
    fn integer_seed_is_used_verbatim() {
        let policy: SeedPolicy = "42".parse().expect("integer seed");
        assert_eq!(policy, SeedPolicy::Fixed(42));
        assert_eq!(policy.resolve(), Some(42));

        let max: SeedPolicy = u64::MAX.to_string().parse().expect("max seed");
        assert_eq!(max.resolve(), Some(u64::MAX));
    }

    #[test]
    fn malformed_seed_is_rejected() {
        for input in ["abc", "1.5", "-3", "", "random"] {
            let error = input.parse::<SeedPolicy>().expect_err("invalid seed");
            assert_eq!(
                error,
                SeedError::Invalid {
                    input: input.to_string()
                }
            );
            assert!(error.to_string().contains("'rand', or 'null'"));
        }
    }

    #[test]
    fn null_seed_resolves_to_none() {
        assert_eq!(SeedPolicy::Null.resolve(), None);
    }

    #[test]
    fn random_seeds_do_not_collide() {
        let first = SeedPolicy::Random.resolve().expect("random seed");
        let second = SeedPolicy::Random.resolve().expect("random seed");
        assert_ne!(first, second);
    }

    #[test]
    fn random_seed_follows_injected_rng() {
        let mut left = StdRng::seed_from_u64(7);
        let mut right = StdRng::seed_from_u64(7);
        assert_eq!(
            SeedPolicy::Random.resolve_with(&mut left),
            SeedPolicy::Random.resolve_with(&mut right)
        );
    }

    #[test]
    fn read_prompt_trims_input() {
        let prompt = read_prompt(Cursor::new("  a fox in the snow \n")).expect("prompt");
        assert_eq!(prompt, "a fox in the snow");
    }

    #[test]
    fn read_prompt_rejects_whitespace_only_input() {
        let error = read_prompt(Cursor::new(" \n\t ")).expect_err("empty prompt");
        assert!(matches!(error, PromptError::Empty));

        let error = read_prompt(Cursor::new("")).expect_err("empty prompt");
        assert!(matches!(error, PromptError::Empty));
    }
}
