pub mod batch_spec;
pub mod loaders;
pub mod record;

pub use batch_spec::BatchSpec;
pub use loaders::{load_all_batch_specs, load_batch_spec};
pub use record::{now_epoch_secs, RecordStatus, RecordUpdate, RequestRecord};
