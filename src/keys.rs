//! Broker key schema. Workers written in other languages depend on these
//! exact names.

/// Worker → dispatcher stream.
pub fn outbound_stream(job_id: &str) -> String {
    format!("job:{job_id}:out")
}

/// Dispatcher → worker stream.
pub fn inbound_stream(job_id: &str) -> String {
    format!("job:{job_id}:in")
}

/// Active-job record for a chat channel.
pub fn conversation(platform: &str, channel_id: &str) -> String {
    format!("conversation:{platform}:{channel_id}")
}

/// Reverse index from job ID to its conversation key.
pub fn job_index(job_id: &str) -> String {
    format!("job-index:{job_id}")
}

/// Cached clarification prompt for a chat channel.
pub fn clarification(platform: &str, channel_id: &str) -> String {
    format!("clarification:{platform}:{channel_id}")
}
