pub mod artifact;
pub mod command;
pub mod dada2;
pub mod derep;
pub mod fastx;
pub mod file;
pub mod report;
pub mod runlog;
pub mod runner;
pub mod samples;
pub mod system;
pub mod table;
