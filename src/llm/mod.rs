pub mod activation;
pub mod causal_self_attention;
pub mod chat_template;
pub mod decoder;
pub mod embedding;
pub mod inference;
pub mod layer;
pub mod linear;
pub mod lm_head;
pub mod loader;
pub mod mlp;
pub mod models;
pub mod rms_norm;
pub mod rotary;
pub mod sampling;
pub mod tokenizer;
pub mod weights;
