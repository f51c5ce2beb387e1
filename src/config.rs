pub use self::parser::{
    CacheConfig, Config, FanoutConfig, PlatformConfig, SecurityConfig, StoreConfig, StoreType,
    WebConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
