pub mod local;
pub mod memory;
pub mod webdis;

pub use local::LocalVectorStore;
pub use memory::MemoryCache;
pub use webdis::WebdisCache;
