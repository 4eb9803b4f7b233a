use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key a memoized computation is stored under.
///
/// A key is made of an *origin*, which identifies the computation (usually the call site), and any
/// number of arguments. Both are rendered into human-readable metadata, which is then hashed.
/// Two keys compare equal if and only if their metadata is identical.
///
/// The metadata encoding is unambiguous: the origin is escaped, and every argument as well as any
/// free-form metadata is prefixed with its length, so no rendering can pose as another section.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    origin: Arc<str>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#", self.origin)?;
        for b in &self.hash[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a key for a computation without arguments.
    pub fn new(origin: impl Into<String>) -> Self {
        Self::builder(origin).build()
    }

    /// Creates a [`CacheKeyBuilder`] for the computation identified by `origin`.
    pub fn builder(origin: impl Into<String>) -> CacheKeyBuilder {
        let origin = origin.into();
        let metadata = format!("origin: {origin:?}\n");
        CacheKeyBuilder {
            origin,
            metadata,
            extra: String::new(),
            args: 0,
        }
    }

    /// The identifier of the computation this key belongs to.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The hex-formatted sha-256 digest of the metadata.
    pub fn digest(&self) -> String {
        let mut digest = String::with_capacity(64);
        for b in &self.hash {
            // writing into a `String` is infallible
            let _ = write!(digest, "{b:02x}");
        }
        digest
    }
}

/// A builder for [`CacheKey`]s.
///
/// Arguments are captured by value at the time they are added, using their [`Debug`](fmt::Debug)
/// representation. That representation must be **stable**: values that are equal have to render
/// identically (beware of types like `HashMap` with unspecified iteration order).
///
/// The builder also implements the [`Write`](std::fmt::Write) trait to add free-form metadata.
pub struct CacheKeyBuilder {
    origin: String,
    metadata: String,
    extra: String,
    args: usize,
}

impl CacheKeyBuilder {
    /// Appends one argument to the key.
    pub fn arg<A: fmt::Debug + ?Sized>(&mut self, value: &A) -> &mut Self {
        let rendered = format!("{value:?}");
        let _ = writeln!(
            self.metadata,
            "arg{} ({}): {rendered}",
            self.args,
            rendered.len()
        );
        self.args += 1;
        self
    }

    /// Like [`arg`](Self::arg), but consumes and returns the builder.
    pub fn with_arg<A: fmt::Debug + ?Sized>(mut self, value: &A) -> Self {
        self.arg(value);
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(mut self) -> CacheKey {
        if !self.extra.is_empty() {
            let _ = writeln!(self.metadata, "extra ({}): {}", self.extra.len(), self.extra);
        }
        let digest = Sha256::digest(&self.metadata);
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);

        CacheKey {
            origin: self.origin.into(),
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extra.write_str(s)
    }
}

/// Expands to a string identifying the location it is invoked at.
#[macro_export]
macro_rules! call_site {
    () => {
        concat!(module_path!(), "@", file!(), ":", line!(), ":", column!())
    };
}

/// Builds a [`CacheKey`] from an origin and any number of arguments.
///
/// Without an explicit `origin: "name"`, the origin is derived from the call site, so two
/// invocations in different places never share entries, while repeated invocations of the same
/// place with equal arguments always do.
///
/// ```
/// use memo_cache::cache_key;
///
/// let user_id = 42;
/// let named = cache_key!(origin: "users.by_id", user_id);
/// assert_eq!(named, cache_key!(origin: "users.by_id", 42));
///
/// let here = cache_key!(user_id);
/// let there = cache_key!(user_id);
/// assert_ne!(here, there);
/// ```
#[macro_export]
macro_rules! cache_key {
    (origin: $origin:expr $(, $arg:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut builder = $crate::CacheKey::builder($origin);
        $( builder.arg(&$arg); )*
        builder.build()
    }};
    ($($arg:expr),* $(,)?) => {
        $crate::cache_key!(origin: $crate::call_site!() $(, $arg)*)
    };
}
