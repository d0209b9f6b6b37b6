pub mod agent;
pub mod capability;
pub mod image;
pub mod llm;
pub mod panel;
pub mod pipeline;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
