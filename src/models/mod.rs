pub mod envelope;
pub mod fragment;
pub mod handle;
pub mod key;
pub mod placement;
pub mod record;
pub mod set;
pub mod status;
