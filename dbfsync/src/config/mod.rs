mod parser;
mod types;

pub use parser::{load_or_init, parse_config, parse_config_str};
pub use types::{ConfigFile, Engine, RelationDefinition, CONFIG_TEMPLATE};
