pub mod model_loaders;

pub use model_loaders::{load_execution_process_middleware, load_workspace_middleware};
