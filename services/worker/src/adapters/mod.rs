pub mod classifier;
pub mod db;
pub mod youtube;

pub use classifier::OpenAiClassifierAdapter;
pub use db::DbAdapter;
pub use youtube::YoutubeLikesAdapter;
