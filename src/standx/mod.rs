// ─── Venue connectivity ───
pub mod api;
pub mod auth;
pub mod transport;

// ─── Push streams + cached state ───
pub mod backoff;
pub mod cache;
pub mod correlation;
pub mod messages;
pub mod stream;

// ─── Strategy ───
pub mod engine;
pub mod mode;
pub mod quote;
pub mod venue;

// ─── Shared types ───
pub mod types;
