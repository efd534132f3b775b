//! Identifier types and the derived-id normalization rule (spec.md §3).

use std::sync::atomic::{AtomicU64, Ordering};

/// A stable, derived game id. Plain `String` alias: the derivation rule in
/// [`normalize`] is the only legal way to produce one inside the core, but
/// callers crossing the protocol boundary (tests, the transport layer) need
/// to pass bare strings around freely.
pub type GameId = String;

/// The upstream agent's `action.id` / `action/result.id` correlation key.
pub type RequestId = String;

/// An opaque, transport-assigned handle for one websocket peer, downstream
/// or upstream. The core never interprets the value — it only uses it as a
/// map key and as the argument to [`crate::transport::Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// The well-known id of the single upstream agent connection. Zero is
    /// never handed out by [`PeerId::next`], so this can never collide with
    /// a downstream peer.
    pub const UPSTREAM: PeerId = PeerId(0);

    /// Generates a fresh downstream peer id. Backed by a process-wide
    /// counter rather than per-transport state, since a relay process hosts
    /// exactly one transport pair but may in principle run more than one
    /// [`crate::controller::RelayController`] (spec.md §9, "global mutable
    /// state" redesign note) — a shared counter still keeps ids unique
    /// across all of them.
    pub fn next() -> PeerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PeerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == PeerId::UPSTREAM {
            write!(f, "peer#upstream")
        } else {
            write!(f, "peer#{}", self.0)
        }
    }
}

/// Applies the derived identifier rule from spec.md §3 to a game's declared
/// display name: lowercase, collapse whitespace runs to a single hyphen,
/// drop everything outside `[a-z0-9-]`, collapse consecutive hyphens, trim
/// leading/trailing hyphens.
///
/// The empty result is a legal *output* of this function but an illegal
/// *session id* — callers must reject it (spec.md §3, §4.1 `OpenError::EmptyId`).
pub fn normalize(display_name: &str) -> GameId {
    let lowercase = display_name.to_lowercase();

    let mut hyphenated = String::with_capacity(lowercase.len());
    let mut last_was_space = false;
    for ch in lowercase.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                hyphenated.push('-');
            }
            last_was_space = true;
        } else {
            hyphenated.push(ch);
            last_was_space = false;
        }
    }

    let filtered: String = hyphenated
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    let mut collapsed = String::with_capacity(filtered.len());
    let mut last_was_hyphen = false;
    for ch in filtered.chars() {
        if ch == '-' {
            if !last_was_hyphen {
                collapsed.push('-');
            }
            last_was_hyphen = true;
        } else {
            collapsed.push(ch);
            last_was_hyphen = false;
        }
    }

    collapsed.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_boundary_example() {
        assert_eq!(
            normalize("Buckshot Roulette: Extended Edition!!!"),
            "buckshot-roulette-extended-edition"
        );
    }

    #[test]
    fn all_punctuation_normalizes_to_empty() {
        assert_eq!(normalize("-- --"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["Game A", "-- --", "tic_tac__toe!!", "  multi   space  "] {
            let once = normalize(input);
            let twice = normalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn distinct_peer_ids_never_collide_with_upstream() {
        for _ in 0..8 {
            assert_ne!(PeerId::next(), PeerId::UPSTREAM);
        }
    }
}
