//! Fetch orchestration covering chain head tracking, batch scaling, planning,
//! dispatch, and the lifecycle of their background tasks.

pub mod backoff;
pub mod dispatch;
pub mod fetcher;
pub mod lifecycle;
pub mod scale;
pub mod tip;
