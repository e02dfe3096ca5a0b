mod run;

pub use run::{SETUP_MANIFEST_FILENAME, run};
