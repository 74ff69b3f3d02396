use log::error;

/// Single funnel mapping internal failures to log events.
///
/// The reconciliation core never panics and never aborts the process: a
/// failed write leaves the database a subset of the intended state, and a
/// later event or the startup sync converges it.
pub fn failure(context: impl std::fmt::Display, err: impl std::fmt::Display) {
    error!("{context}: {err}");
}
