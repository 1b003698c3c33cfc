use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    // Requests need the identity a bus or compute probe provides
    #[error("GPU \"{id}\" has no {field} yet")]
    IncompleteIdentity { id: String, field: &'static str },
    #[error("Failed to serialize GPU request")]
    Serialize(#[from] serde_json::Error),
}
