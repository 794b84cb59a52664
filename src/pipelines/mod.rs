pub mod amplicon;
pub mod samples;
pub mod tables;
