pub mod conversation;
pub mod logits_processor;
pub mod openai_server;
pub mod pipelines;
pub mod requests;
pub mod responses;
pub mod sampling_params;
