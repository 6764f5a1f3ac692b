use super::{
    CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaSolution, encode_image,
    poll_until_ready,
};
use crate::challenges::core::Challenge;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://api.capmonster.cloud/";

/// Adapter for the CapMonster Cloud `createTask` / `getTaskResult` API.
#[derive(Debug, Clone)]
pub struct CapMonsterProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    endpoint: Url,
    client: reqwest::Client,
}

impl CapMonsterProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("invalid capmonster endpoint"),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn task_payload(&self, challenge: &Challenge) -> Value {
        let task = match challenge {
            Challenge::StaticImage { image, .. } => json!({
                "type": "ImageToTextTask",
                "body": encode_image(image),
            }),
            Challenge::Interactive { site_key, page_url } => json!({
                "type": "NoCaptchaTaskProxyless",
                "websiteURL": page_url.as_str(),
                "websiteKey": site_key,
                "isInvisible": true,
            }),
        };
        json!({ "clientKey": self.api_key, "task": task })
    }

    fn url(&self, path: &str) -> Result<Url, CaptchaError> {
        self.endpoint
            .join(path)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskReply {
    error_id: u8,
    error_code: Option<String>,
    task_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultReply {
    error_id: u8,
    error_code: Option<String>,
    status: Option<String>,
    solution: Option<TaskSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSolution {
    text: Option<String>,
    g_recaptcha_response: Option<String>,
}

fn classify_error(code: Option<String>) -> CaptchaError {
    let code = code.unwrap_or_else(|| "ERROR_UNKNOWN".to_string());
    match code.as_str() {
        "ERROR_KEY_DOES_NOT_EXIST" | "ERROR_ZERO_BALANCE" => CaptchaError::Configuration(code),
        "ERROR_CAPTCHA_UNSOLVABLE" => CaptchaError::Unsolvable(code),
        _ => CaptchaError::Provider(code),
    }
}

fn created_task(reply: CreateTaskReply) -> Result<u64, CaptchaError> {
    if reply.error_id != 0 {
        return Err(classify_error(reply.error_code));
    }
    reply
        .task_id
        .ok_or_else(|| CaptchaError::Provider("createTask reply without taskId".into()))
}

fn task_result(reply: TaskResultReply) -> Result<Option<CaptchaSolution>, CaptchaError> {
    if reply.error_id != 0 {
        return Err(classify_error(reply.error_code));
    }
    if reply.status.as_deref() != Some("ready") {
        return Ok(None);
    }
    let token = reply
        .solution
        .and_then(|solution| solution.g_recaptcha_response.or(solution.text))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CaptchaError::Unsolvable("empty solution".into()))?;
    Ok(Some(CaptchaSolution::new(token)))
}

#[async_trait]
impl CaptchaProvider for CapMonsterProvider {
    fn name(&self) -> &'static str {
        "capmonster"
    }

    async fn solve(&self, challenge: &Challenge) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration(
                "missing capmonster api key".into(),
            ));
        }

        let reply: CreateTaskReply = self
            .client
            .post(self.url("createTask")?)
            .json(&self.task_payload(challenge))
            .send()
            .await?
            .json()
            .await?;
        let task_id = created_task(reply)?;
        log::debug!("capmonster task {task_id} created for {:?}", challenge.kind());

        let result_url = self.url("getTaskResult")?;
        let body = json!({ "clientKey": self.api_key, "taskId": task_id });
        let solution = poll_until_ready(&self.config, || {
            let request = self.client.post(result_url.clone()).json(&body);
            async move {
                let reply: TaskResultReply = request.send().await?.json().await?;
                task_result(reply)
            }
        })
        .await?;

        Ok(solution.insert_metadata("task_id", task_id.to_string()))
    }
}
