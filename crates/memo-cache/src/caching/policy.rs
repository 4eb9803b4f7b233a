use std::time::Duration;

use serde::Deserialize;

/// Expiration directive applied to a freshly computed value.
///
/// - `absolute_ttl` counts from the time the value was written.
/// - `sliding_ttl` is reset on every read, but never extends an entry past its `absolute_ttl`.
///
/// With neither set, the value does not expire by policy and is only subject to the capacity
/// based eviction of the backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Maximum time since the value was written.
    #[serde(with = "humantime_serde")]
    pub absolute_ttl: Option<Duration>,

    /// Maximum time since the value was last read.
    #[serde(with = "humantime_serde")]
    pub sliding_ttl: Option<Duration>,
}

impl CachePolicy {
    /// A policy that keeps values around until evicted by capacity.
    pub const fn never_expire() -> Self {
        Self {
            absolute_ttl: None,
            sliding_ttl: None,
        }
    }

    /// A policy expiring values `ttl` after they were written.
    pub const fn absolute(ttl: Duration) -> Self {
        Self::never_expire().with_absolute(ttl)
    }

    /// A policy expiring values once they were not read for `ttl`.
    pub const fn sliding(ttl: Duration) -> Self {
        Self::never_expire().with_sliding(ttl)
    }

    pub const fn with_absolute(mut self, ttl: Duration) -> Self {
        self.absolute_ttl = Some(ttl);
        self
    }

    pub const fn with_sliding(mut self, ttl: Duration) -> Self {
        self.sliding_ttl = Some(ttl);
        self
    }

    /// Whether values written with this policy expire at all.
    pub fn expires(&self) -> bool {
        self.absolute_ttl.is_some() || self.sliding_ttl.is_some()
    }

    /// Rejects zero durations, which would make every write invisible to the next reader.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.absolute_ttl == Some(Duration::ZERO) {
            return Err("absolute_ttl must be greater than zero");
        }
        if self.sliding_ttl == Some(Duration::ZERO) {
            return Err("sliding_ttl must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let policy = CachePolicy::absolute(Duration::from_secs(60))
            .with_sliding(Duration::from_secs(5));
        assert_eq!(policy.absolute_ttl, Some(Duration::from_secs(60)));
        assert_eq!(policy.sliding_ttl, Some(Duration::from_secs(5)));
        assert!(policy.expires());

        assert!(!CachePolicy::never_expire().expires());
        assert_eq!(CachePolicy::default(), CachePolicy::never_expire());
    }

    #[test]
    fn test_validate() {
        assert!(CachePolicy::never_expire().validate().is_ok());
        assert!(CachePolicy::sliding(Duration::from_millis(1)).validate().is_ok());
        assert!(CachePolicy::absolute(Duration::ZERO).validate().is_err());
        assert!(CachePolicy::sliding(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_deserialize() {
        let policy: CachePolicy = serde_yaml::from_str("absolute_ttl: 150ms").unwrap();
        assert_eq!(policy, CachePolicy::absolute(Duration::from_millis(150)));

        let policy: CachePolicy =
            serde_yaml::from_str("absolute_ttl: 1h\nsliding_ttl: 5m").unwrap();
        assert_eq!(
            policy,
            CachePolicy::absolute(Duration::from_secs(3600)).with_sliding(Duration::from_secs(300))
        );

        let policy: CachePolicy = serde_yaml::from_str("{}").unwrap();
        assert!(!policy.expires());
    }
}
