pub mod cache;
pub mod chunking;
pub mod cleaning;
pub mod dedup;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod manager;
pub mod models;
pub mod retry;
pub mod stores;
pub mod vector_store;

pub use cache::{cache_key, CacheTtl, QueryCache};
pub use chunking::{chunk_pages, split_text, ChunkingConfig, RawChunk};
pub use cleaning::{strip_running_lines, TextCleaner};
pub use dedup::{deduplicate, DedupStats};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingEndpoint, HttpEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::RagError;
pub use extractor::{extract_pages, OcrEndpointConfig, PageText};
pub use generation::{AnswerGenerator, GeneratorConfig, HttpGenerator};
pub use ingest::{discover_documents, document_id_from_path};
pub use manager::{Backends, IndexManager};
pub use models::{
    collection_name, BuildReport, Chunk, DedupStrategy, DeleteReport, Document, IndexState,
    IndexStatus, QueryOutcome, RagOptions, Source,
};
pub use retry::RetryPolicy;
pub use stores::{LocalVectorStore, MemoryCache, WebdisCache};
pub use vector_store::{Collection, CollectionWriter, ScoredChunk, VectorStore};
