use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response body shared by every JSON route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub retcode: i32,
    pub retmsg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn success() -> Self {
        Self {
            retcode: 0,
            retmsg: "success".to_string(),
            job_id: None,
            data: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::success()
        }
    }

    pub fn error(retcode: i32, retmsg: impl Into<String>) -> Self {
        Self {
            retcode,
            retmsg: retmsg.into(),
            job_id: None,
            data: None,
        }
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.retcode == 0
    }
}
