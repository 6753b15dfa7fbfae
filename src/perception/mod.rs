pub mod preprocess;
#[cfg(feature = "desktop")]
pub mod screenshot;
pub mod traits;
pub mod types;
