mod loader;
mod schema;

pub use loader::{load_from_env_or_file, load_from_path, substitute_env_vars, validate};
pub use schema::*;
