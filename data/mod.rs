pub mod dataset;
pub mod tables;

pub use dataset::{ClassWeight, Sample, SequenceDataset};
pub use tables::{DataError, Split, SplitTables, Splits, VarRoles, load_tables};
