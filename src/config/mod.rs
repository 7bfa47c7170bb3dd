mod app_config;

pub use app_config::{
    default_renditions, AppConfig, DatabaseConfig, FfmpegConfig, PosterConfig, PreviewConfig,
    ServerConfig, StorageConfig, WorkerConfig,
};
