pub(crate) mod error;
pub(crate) mod metrics;
pub(crate) mod observe;
#[cfg(feature = "otel")]
pub(crate) mod otel;
pub(crate) mod util;
