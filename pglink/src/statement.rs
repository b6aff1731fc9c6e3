//! Prepared statement and portal handles.
use std::sync::{Arc, atomic::Ordering};

use crate::{common::unit_error, postgres::Oid, row::RowDescription};

type AtomicId = std::sync::atomic::AtomicU16;

/// Server-side object name, either generated or unnamed.
#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 6]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 6])
    }

    pub(crate) fn next(prefix: u8, atomic: &AtomicId) -> Self {
        let id = atomic.fetch_add(1, Ordering::SeqCst);
        let mut buf = [prefix, b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            #[allow(unused, reason = "not every delegate uses the unnamed form")]
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            pub(crate) fn next() -> Self {
                static ID: AtomicId = AtomicId::new(0);
                Self(Id::next($prefix, &ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName, b's');
delegate!(PortalName, b'p');

/// Client-side row limit configuration.
///
/// Two composable knobs: a 32-bit-range limit and a 64-bit-range limit over
/// the same underlying value. Zero means unbounded. The wire protocol's
/// row-count field is 32-bit, so a 64-bit value beyond that range behaves as
/// unbounded on the wire and reports zero through the 32-bit accessor while
/// the 64-bit accessor keeps reporting the true value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLimit {
    large: u64,
}

impl RowLimit {
    /// Unbounded limit.
    pub const fn new() -> Self {
        Self { large: 0 }
    }

    /// Set the limit through the 32-bit knob.
    ///
    /// A negative `max` is rejected and leaves the previous value unchanged.
    pub fn set_max_rows(&mut self, max: i32) -> Result<(), InvalidRowLimit> {
        if max < 0 {
            return Err(InvalidRowLimit);
        }
        self.large = max as u64;
        Ok(())
    }

    /// The limit as seen through the 32-bit knob.
    ///
    /// Reports zero (unbounded) when the value exceeds the 32-bit range.
    pub fn max_rows(&self) -> i32 {
        match i32::try_from(self.large) {
            Ok(max) => max,
            Err(_) => 0,
        }
    }

    /// Set the limit through the 64-bit knob.
    ///
    /// A negative `max` is rejected and leaves the previous value unchanged.
    pub fn set_large_max_rows(&mut self, max: i64) -> Result<(), InvalidRowLimit> {
        if max < 0 {
            return Err(InvalidRowLimit);
        }
        self.large = max as u64;
        Ok(())
    }

    /// The limit as seen through the 64-bit knob.
    pub fn large_max_rows(&self) -> i64 {
        self.large as i64
    }

    /// The limit for the Execute message row-count field.
    ///
    /// Values beyond the field's range degrade to zero (unbounded).
    pub(crate) fn wire_limit(&self) -> u32 {
        match i32::try_from(self.large) {
            Ok(max) => max as u32,
            Err(_) => 0,
        }
    }
}

unit_error! {
    /// An error when setting a negative row limit.
    pub struct InvalidRowLimit("row limit must not be negative");
}

/// A prepared statement, owned by the [`Connection`][crate::Connection]
/// that created it.
///
/// Created by [`prepare`][crate::Connection::prepare]; destroyed explicitly
/// by [`close_statement`][crate::Connection::close_statement] or implicitly
/// when the connection closes.
#[derive(Debug)]
pub struct Statement {
    name: StatementName,
    /// Cache key when the statement came from the statement cache.
    pub(crate) sql_hash: Option<u64>,
    param_oids: Vec<Oid>,
    columns: Option<Arc<RowDescription>>,
    limit: RowLimit,
}

impl Statement {
    pub(crate) fn new(
        name: StatementName,
        param_oids: Vec<Oid>,
        columns: Option<Arc<RowDescription>>,
    ) -> Self {
        Self { name, sql_hash: None, param_oids, columns, limit: RowLimit::new() }
    }

    /// The server-side statement name.
    pub fn name(&self) -> &StatementName {
        &self.name
    }

    /// Parameter type oids, in placeholder order.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result column metadata, [`None`] when the statement returns no rows.
    pub fn columns(&self) -> Option<&Arc<RowDescription>> {
        self.columns.as_ref()
    }

    /// The statement-level row limit.
    pub fn limit(&self) -> &RowLimit {
        &self.limit
    }

    /// Mutable access to the statement-level row limit.
    pub fn limit_mut(&mut self) -> &mut RowLimit {
        &mut self.limit
    }
}

/// A bound, executable instance of a [`Statement`].
///
/// Created by [`bind`][crate::Connection::bind]; consumed by
/// [`execute`][crate::Connection::execute]; destroyed after completion or by
/// [`close_portal`][crate::Connection::close_portal].
#[derive(Debug)]
pub struct Portal {
    name: PortalName,
    statement: StatementName,
    columns: Option<Arc<RowDescription>>,
    /// Row limit captured from the source statement at bind time.
    pub(crate) limit: RowLimit,
}

impl Portal {
    pub(crate) fn new(
        name: PortalName,
        statement: StatementName,
        columns: Option<Arc<RowDescription>>,
        limit: RowLimit,
    ) -> Self {
        Self { name, statement, columns, limit }
    }

    /// The server-side portal name.
    pub fn name(&self) -> &PortalName {
        &self.name
    }

    /// The name of the source prepared statement.
    pub fn statement(&self) -> &StatementName {
        &self.statement
    }

    /// Result column metadata with bind-time formats, [`None`] when the
    /// portal returns no rows.
    pub fn columns(&self) -> Option<&Arc<RowDescription>> {
        self.columns.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_names_are_unique() {
        let a = StatementName::next();
        let b = StatementName::next();
        assert_ne!(a.as_str(), b.as_str());
        assert!(a.as_str().starts_with('s'));
        assert!(PortalName::next().as_str().starts_with('p'));
        assert_eq!(PortalName::unnamed().as_str(), "");
    }

    #[test]
    fn negative_max_rows_rejected() {
        let mut limit = RowLimit::new();
        assert!(limit.set_max_rows(-123).is_err());
        assert_eq!(limit.max_rows(), 0);
        assert_eq!(limit.large_max_rows(), 0);

        assert!(limit.set_large_max_rows(-123).is_err());
        assert_eq!(limit.max_rows(), 0);

        // a rejected set leaves an earlier valid value untouched
        limit.set_max_rows(25).unwrap();
        assert!(limit.set_max_rows(-1).is_err());
        assert_eq!(limit.max_rows(), 25);
    }

    #[test]
    fn large_limit_beyond_int_range() {
        let mut limit = RowLimit::new();
        limit.set_large_max_rows(i32::MAX as i64 + 12345).unwrap();
        assert_eq!(limit.max_rows(), 0);
        assert_eq!(limit.large_max_rows(), 2_147_483_659);
        assert_eq!(limit.wire_limit(), 0);
    }

    #[test]
    fn limit_within_int_range() {
        let mut limit = RowLimit::new();
        limit.set_large_max_rows(25).unwrap();
        assert_eq!(limit.max_rows(), 25);
        assert_eq!(limit.large_max_rows(), 25);
        assert_eq!(limit.wire_limit(), 25);
    }
}
