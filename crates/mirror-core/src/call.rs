//! Self-describing call identifiers.
//!
//! No process holds call state, so a call id must carry enough to find the
//! other party. It is minted as `{initiator}-{created_ms}-{target}`, with `%`
//! and `-` inside each identity percent-escaped so ids containing dashes
//! (UUIDs, for instance) split unambiguously.
//!
//! The two-part form `{initiator}-{created_ms}` is still accepted. From the
//! target's side it resolves to the initiator; from the initiator's side the
//! peer is unknown.

use std::fmt;
use std::str::FromStr;

use crate::error::RoutingError;
use crate::identity::{now_millis, Identity};

/// A parsed call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId {
    initiator: Identity,
    created_at: u64,
    target: Option<Identity>,
}

impl CallId {
    /// Mint a call id for a call from `initiator` to `target`, stamped now.
    #[must_use]
    pub fn mint(initiator: &Identity, target: &Identity) -> Self {
        Self::new(initiator.clone(), now_millis(), Some(target.clone()))
    }

    /// Build a call id from its parts.
    #[must_use]
    pub fn new(initiator: Identity, created_at: u64, target: Option<Identity>) -> Self {
        Self {
            initiator,
            created_at,
            target,
        }
    }

    /// Parse a call id.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidCallId`] if the id does not have two or
    /// three parts, an identity part is empty, or the timestamp is not a
    /// number.
    pub fn parse(raw: &str) -> Result<Self, RoutingError> {
        let invalid = || RoutingError::InvalidCallId(raw.to_string());

        let parts: Vec<&str> = raw.split('-').collect();
        let (initiator, created_at, target) = match parts.as_slice() {
            [initiator, created_at] => (*initiator, *created_at, None),
            [initiator, created_at, target] => (*initiator, *created_at, Some(*target)),
            _ => return Err(invalid()),
        };

        if initiator.is_empty() || target.is_some_and(str::is_empty) {
            return Err(invalid());
        }
        let created_at = created_at.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self {
            initiator: Identity::new(unescape(initiator)),
            created_at,
            target: target.map(|t| Identity::new(unescape(t))),
        })
    }

    /// The caller.
    #[must_use]
    pub fn initiator(&self) -> &Identity {
        &self.initiator
    }

    /// The callee, absent in two-part ids.
    #[must_use]
    pub fn target(&self) -> Option<&Identity> {
        self.target.as_ref()
    }

    /// Creation time in milliseconds since the epoch.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The other party of the call, seen from `local`.
    ///
    /// A caller that is neither party is answered with the initiator; the
    /// relay does not validate membership.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownPeer`] when `local` is the initiator of
    /// a two-part id.
    pub fn peer_of(&self, local: &str) -> Result<Identity, RoutingError> {
        if self.initiator == *local {
            return self
                .target
                .clone()
                .ok_or_else(|| RoutingError::UnknownPeer(self.to_string()));
        }
        Ok(self.initiator.clone())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", escape(self.initiator.as_str()), self.created_at)?;
        if let Some(target) = &self.target {
            write!(f, "-{}", escape(target.as_str()))?;
        }
        Ok(())
    }
}

impl FromStr for CallId {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn escape(identity: &str) -> String {
    identity.replace('%', "%25").replace('-', "%2D")
}

fn unescape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.get(1..3).is_some_and(|hex| hex.eq_ignore_ascii_case("2D")) {
            out.push('-');
            rest = &tail[3..];
        } else if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    #[test]
    fn test_peer_recovery_is_symmetric() {
        let call = CallId::mint(&id("alice"), &id("bob"));
        let parsed = CallId::parse(&call.to_string()).unwrap();

        assert_eq!(parsed.peer_of("alice").unwrap(), id("bob"));
        assert_eq!(parsed.peer_of("bob").unwrap(), id("alice"));
    }

    #[test]
    fn test_format() {
        let call = CallId::new(id("alice"), 1_700_000_000_000, Some(id("bob")));
        assert_eq!(call.to_string(), "alice-1700000000000-bob");
    }

    #[test]
    fn test_identities_with_dashes() {
        let alice = id("5f1c-77aa-9e01");
        let bob = id("b0b-%-x");
        let call = CallId::mint(&alice, &bob);
        let text = call.to_string();
        assert_eq!(text.matches('-').count(), 2);

        let parsed: CallId = text.parse().unwrap();
        assert_eq!(parsed.initiator(), &alice);
        assert_eq!(parsed.target(), Some(&bob));
        assert_eq!(parsed.peer_of(alice.as_str()).unwrap(), bob);
        assert_eq!(parsed.peer_of(bob.as_str()).unwrap(), alice);
    }

    #[test]
    fn test_two_part_id() {
        let parsed = CallId::parse("alice-1700000000000").unwrap();
        assert_eq!(parsed.target(), None);
        assert_eq!(parsed.created_at(), 1_700_000_000_000);

        assert_eq!(parsed.peer_of("bob").unwrap(), id("alice"));
        assert!(matches!(
            parsed.peer_of("alice"),
            Err(RoutingError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_outsider_gets_initiator() {
        let parsed = CallId::parse("alice-1-bob").unwrap();
        assert_eq!(parsed.peer_of("mallory").unwrap(), id("alice"));
    }

    #[test]
    fn test_invalid_ids() {
        for raw in ["", "alice", "alice-now-bob", "-1-bob", "alice-1-", "a-1-b-c"] {
            assert!(
                matches!(CallId::parse(raw), Err(RoutingError::InvalidCallId(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_unescape_leaves_unknown_sequences() {
        assert_eq!(unescape("100%"), "100%");
        assert_eq!(unescape("a%41b"), "a%41b");
        assert_eq!(unescape("a%2db"), "a-b");
    }
}
