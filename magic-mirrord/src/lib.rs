pub mod daemon;
pub mod session;
pub mod sync;
