use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Per-route chat model selection, with quality/cost trade-offs per route.
#[derive(Clone, Deserialize, Debug)]
pub struct RouteModels {
    #[serde(default = "default_chat_model")]
    pub general_qa: String,
    #[serde(default = "default_chat_model")]
    pub follow_up: String,
    #[serde(default = "default_chat_model")]
    pub quote_finding: String,
    #[serde(default = "default_guide_model")]
    pub generate_study_guide: String,
    #[serde(default = "default_chat_model")]
    pub summary: String,
}

impl Default for RouteModels {
    fn default() -> Self {
        Self {
            general_qa: default_chat_model(),
            follow_up: default_chat_model(),
            quote_finding: default_chat_model(),
            generate_study_guide: default_guide_model(),
            summary: default_chat_model(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,

    // Rate ledger
    #[serde(default = "default_tpm_limit")]
    pub tpm_limit: u64,

    // Context-window guard rails
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_max_class_summary_tokens")]
    pub max_class_summary_tokens: usize,
    #[serde(default = "default_max_hierarchical_input_tokens")]
    pub max_hierarchical_input_tokens: usize,
    #[serde(default = "default_true")]
    pub hierarchical_class_summary_enabled: bool,

    // Retrieval knobs
    #[serde(default = "default_rag_k")]
    pub rag_k: usize,
    #[serde(default = "default_rag_k_followup")]
    pub rag_k_followup: usize,
    #[serde(default = "default_rag_k_quote")]
    pub rag_k_quote: usize,
    #[serde(default = "default_rag_k_guide")]
    pub rag_k_guide: usize,
    #[serde(default = "default_rag_k_sum")]
    pub rag_k_sum: usize,
    #[serde(default = "default_rag_candidates")]
    pub rag_candidates: usize,
    #[serde(default = "default_temp_general")]
    pub rag_temp_general: f32,
    #[serde(default = "default_temp_general")]
    pub rag_temp_followup: f32,
    #[serde(default = "default_temp_quote")]
    pub rag_temp_quote: f32,
    #[serde(default = "default_temp_guide")]
    pub rag_temp_guide: f32,
    #[serde(default = "default_temp_general")]
    pub rag_temp_sum: f32,
    #[serde(default = "default_rag_max_tokens")]
    pub rag_max_tokens: u32,
    #[serde(default = "default_rag_max_tokens_quote")]
    pub rag_max_tokens_quote: u32,
    #[serde(default = "default_rag_max_tokens_guide")]
    pub rag_max_tokens_guide: u32,
    #[serde(default = "default_rag_max_tokens_sum")]
    pub rag_max_tokens_sum: u32,

    // Models
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default)]
    pub route_models: RouteModels,
    #[serde(default = "default_tiebreak_model")]
    pub router_tiebreak_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,

    // Streaming
    #[serde(default = "default_keepalive_interval_s")]
    pub keepalive_interval_s: u64,

    // Feature flags
    #[serde(default = "default_true")]
    pub contextual_headers_enabled: bool,
    #[serde(default = "default_false")]
    pub hybrid_search_enabled: bool,
    #[serde(default = "default_true")]
    pub reranking_enabled: bool,

    // Ingestion
    #[serde(default = "default_batch_chars")]
    pub batch_chars: usize,
    #[serde(default = "default_summary_on_demand_max")]
    pub summary_on_demand_max: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_http_port() -> u16 {
    8001
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_tpm_limit() -> u64 {
    180_000
}

fn default_max_prompt_tokens() -> usize {
    8_000
}

fn default_max_tokens_per_request() -> usize {
    300_000
}

fn default_max_class_summary_tokens() -> usize {
    12_000
}

fn default_max_hierarchical_input_tokens() -> usize {
    100_000
}

fn default_rag_k() -> usize {
    12
}

fn default_rag_k_followup() -> usize {
    10
}

fn default_rag_k_quote() -> usize {
    20
}

fn default_rag_k_guide() -> usize {
    8
}

fn default_rag_k_sum() -> usize {
    8
}

fn default_rag_candidates() -> usize {
    1_000
}

fn default_temp_general() -> f32 {
    0.2
}

fn default_temp_quote() -> f32 {
    0.0
}

fn default_temp_guide() -> f32 {
    0.3
}

fn default_rag_max_tokens() -> u32 {
    700
}

fn default_rag_max_tokens_quote() -> u32 {
    400
}

fn default_rag_max_tokens_guide() -> u32 {
    1_200
}

fn default_rag_max_tokens_sum() -> u32 {
    600
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_guide_model() -> String {
    "gpt-4o".to_string()
}

fn default_tiebreak_model() -> String {
    "gpt-4.1-nano".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1_536
}

fn default_keepalive_interval_s() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_batch_chars() -> usize {
    8_000
}

fn default_summary_on_demand_max() -> usize {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            surrealdb_address: String::new(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: String::new(),
            surrealdb_database: String::new(),
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            openai_base_url: default_base_url(),
            storage: default_storage_kind(),
            tpm_limit: default_tpm_limit(),
            max_prompt_tokens: default_max_prompt_tokens(),
            max_tokens_per_request: default_max_tokens_per_request(),
            max_class_summary_tokens: default_max_class_summary_tokens(),
            max_hierarchical_input_tokens: default_max_hierarchical_input_tokens(),
            hierarchical_class_summary_enabled: true,
            rag_k: default_rag_k(),
            rag_k_followup: default_rag_k_followup(),
            rag_k_quote: default_rag_k_quote(),
            rag_k_guide: default_rag_k_guide(),
            rag_k_sum: default_rag_k_sum(),
            rag_candidates: default_rag_candidates(),
            rag_temp_general: default_temp_general(),
            rag_temp_followup: default_temp_general(),
            rag_temp_quote: default_temp_quote(),
            rag_temp_guide: default_temp_guide(),
            rag_temp_sum: default_temp_general(),
            rag_max_tokens: default_rag_max_tokens(),
            rag_max_tokens_quote: default_rag_max_tokens_quote(),
            rag_max_tokens_guide: default_rag_max_tokens_guide(),
            rag_max_tokens_sum: default_rag_max_tokens_sum(),
            chat_model: default_chat_model(),
            route_models: RouteModels::default(),
            router_tiebreak_model: default_tiebreak_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            keepalive_interval_s: default_keepalive_interval_s(),
            contextual_headers_enabled: true,
            hybrid_search_enabled: false,
            reranking_enabled: true,
            batch_chars: default_batch_chars(),
            summary_on_demand_max: default_summary_on_demand_max(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
