//! Rate limit key generation and handling.

/// A key that uniquely identifies one leaky bucket.
///
/// The key is a structured pair of the request method and the client
/// identity. Equality and hashing work on the pair, so no choice of method
/// or identity strings can make two different pairs share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The HTTP method, verbatim
    pub method: String,
    /// The client identity (peer IP or forwarding chain)
    pub identity: String,
}

impl RateLimitKey {
    /// Create a new key from a method and client identity.
    pub fn new(method: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            identity: identity.into(),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// This is useful for logging and debugging only; it is never used for
    /// lookups.
    pub fn to_string_key(&self) -> String {
        format!("{}|{}", self.method, self.identity)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_creation() {
        let key = RateLimitKey::new("GET", "10.0.0.1");

        assert_eq!(key.method, "GET");
        assert_eq!(key.identity, "10.0.0.1");
        assert_eq!(key.to_string_key(), "GET|10.0.0.1");
    }

    #[test]
    fn test_key_equality() {
        let key1 = RateLimitKey::new("POST", "10.0.0.1");
        let key2 = RateLimitKey::new("POST", "10.0.0.1");

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_concatenation_does_not_collide() {
        // Naive concatenation maps both of these to "GETX1.2.3.4".
        let a = RateLimitKey::new("GET", "X1.2.3.4");
        let b = RateLimitKey::new("GETX", "1.2.3.4");
        assert_ne!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
