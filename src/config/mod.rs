pub mod settings;

pub use settings::{EngineSettings, Settings, StorageSettings, TransferSettings};
