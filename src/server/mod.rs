mod router;
mod state;

pub use router::build_router;
pub use state::{ModelFactory, ModelSpec, OpenAiModelFactory, ServeState};
