use std::fmt;

/// Interpolation backend used for a resample.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    CPU,
    #[default]
    GPU,
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::CPU => f.write_str("CPU"),
            Processor::GPU => f.write_str("GPU"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
