//! Project slugs: validation and human-readable generation
//!
//! A slug is one DNS label: lowercase ASCII letters, digits and hyphens, at
//! most 63 characters, not starting or ending with a hyphen.

use rand::seq::SliceRandom;
use rand::Rng;

/// Maximum length of a DNS label
pub const MAX_SLUG_LEN: usize = 63;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "brave", "bright", "calm", "clever", "cosmic", "crimson", "curly",
    "dusty", "eager", "early", "fancy", "fierce", "gentle", "golden", "happy", "hidden",
    "humble", "icy", "jolly", "kind", "late", "lively", "lucky", "misty", "nimble", "odd",
    "plain", "proud", "quiet", "rapid", "rusty", "shiny", "silent", "silver", "sleepy",
    "smooth", "snowy", "solid", "spicy", "steady", "sunny", "swift", "tall", "tidy", "vivid",
    "wild", "witty", "young",
];

const NOUNS: &[&str] = &[
    "anchor", "apple", "badger", "beacon", "breeze", "canyon", "cedar", "cloud", "comet",
    "coral", "crane", "delta", "desert", "dragon", "eagle", "ember", "falcon", "fern",
    "forest", "fox", "glacier", "harbor", "hawk", "island", "jungle", "lagoon", "lantern",
    "leaf", "meadow", "meteor", "moon", "mountain", "night", "ocean", "otter", "panda",
    "pebble", "pine", "planet", "quartz", "raven", "river", "rocket", "sparrow", "star",
    "stone", "thunder", "tiger", "valley", "willow",
];

/// Whether a string is a usable project slug
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Length of the random base36 suffix
const SUFFIX_LEN: usize = 5;

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate an `adjective-noun-noun-xxxxx` slug.
///
/// The words keep it readable; the base36 suffix brings the space to about
/// 7.6e12 names. Uniqueness is still probabilistic only.
pub fn generate_slug() -> String {
    generate_slug_with(&mut rand::thread_rng())
}

pub fn generate_slug_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    fn pick<R: Rng + ?Sized>(rng: &mut R, words: &[&'static str]) -> &'static str {
        words.choose(rng).copied().unwrap_or("project")
    }

    let adjective = pick(rng, ADJECTIVES);
    let first = pick(rng, NOUNS);
    let second = pick(rng, NOUNS);
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}-{}", adjective, first, second, suffix)
}
