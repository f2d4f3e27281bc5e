pub mod toml_loader;

pub use toml_loader::{load_all_batch_specs, load_batch_spec};
