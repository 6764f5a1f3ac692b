use super::{
    CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaSolution, encode_image,
    poll_until_ready,
};
use crate::challenges::core::Challenge;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://2captcha.com/";

/// Adapter for the 2Captcha `in.php` / `res.php` API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    endpoint: Url,
    client: reqwest::Client,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("invalid 2captcha endpoint"),
            client: reqwest::Client::new(),
        }
    }

    /// Point the adapter at a compatible API host (self-hosted or test double).
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn submit_form(&self, challenge: &Challenge) -> Vec<(&'static str, String)> {
        let mut form = vec![("key", self.api_key.clone()), ("json", "1".to_string())];
        match challenge {
            Challenge::StaticImage { image, .. } => {
                form.push(("method", "base64".to_string()));
                form.push(("body", encode_image(image)));
            }
            Challenge::Interactive { site_key, page_url } => {
                form.push(("method", "userrecaptcha".to_string()));
                form.push(("googlekey", site_key.clone()));
                form.push(("pageurl", page_url.to_string()));
                form.push(("invisible", "1".to_string()));
            }
        }
        form
    }

    fn url(&self, path: &str) -> Result<Url, CaptchaError> {
        self.endpoint
            .join(path)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    status: u8,
    request: String,
}

/// Interpret an `in.php` reply: the task id on success.
fn task_id(reply: ApiReply) -> Result<String, CaptchaError> {
    if reply.status == 1 {
        Ok(reply.request)
    } else if reply.request.starts_with("ERROR_KEY") || reply.request == "ERROR_WRONG_USER_KEY" {
        Err(CaptchaError::Configuration(reply.request))
    } else {
        Err(CaptchaError::Provider(reply.request))
    }
}

/// Interpret a `res.php` reply: `None` while the worker is still busy.
fn poll_reply(reply: ApiReply) -> Result<Option<CaptchaSolution>, CaptchaError> {
    match (reply.status, reply.request.as_str()) {
        (1, _) => Ok(Some(CaptchaSolution::new(reply.request))),
        (_, "CAPCHA_NOT_READY") => Ok(None),
        (_, "ERROR_CAPTCHA_UNSOLVABLE") | (_, "ERROR_BAD_DUPLICATES") => {
            Err(CaptchaError::Unsolvable(reply.request))
        }
        _ => Err(CaptchaError::Provider(reply.request)),
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn solve(&self, challenge: &Challenge) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing 2captcha api key".into()));
        }

        let reply: ApiReply = self
            .client
            .post(self.url("in.php")?)
            .form(&self.submit_form(challenge))
            .send()
            .await?
            .json()
            .await?;
        let id = task_id(reply)?;
        log::debug!("2captcha task {id} submitted for {:?}", challenge.kind());

        let result_url = self.url("res.php")?;
        let solution = poll_until_ready(&self.config, || {
            let request = self.client.get(result_url.clone()).query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", id.as_str()),
                ("json", "1"),
            ]);
            async move {
                let reply: ApiReply = request.send().await?.json().await?;
                poll_reply(reply)
            }
        })
        .await?;

        Ok(solution.insert_metadata("captcha_id", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u8, request: &str) -> ApiReply {
        ApiReply {
            status,
            request: request.to_string(),
        }
    }

    #[test]
    fn interactive_submission_requests_invisible_recaptcha() {
        let provider = TwoCaptchaProvider::new("key");
        let page = Url::parse("https://dirbs.pta.gov.pk/").unwrap();
        let form = provider.submit_form(&Challenge::interactive("site-key", page));
        assert!(form.contains(&("method", "userrecaptcha".to_string())));
        assert!(form.contains(&("googlekey", "site-key".to_string())));
        assert!(form.contains(&("invisible", "1".to_string())));
    }

    #[test]
    fn image_submission_uses_base64_method() {
        let provider = TwoCaptchaProvider::new("key");
        let form = provider.submit_form(&Challenge::static_image(b"png".to_vec()));
        assert!(form.contains(&("method", "base64".to_string())));
        assert!(form.contains(&("body", "cG5n".to_string())));
    }

    #[test]
    fn replies_are_classified() {
        assert_eq!(task_id(reply(1, "123")).unwrap(), "123");
        assert!(matches!(
            task_id(reply(0, "ERROR_WRONG_USER_KEY")),
            Err(CaptchaError::Configuration(_))
        ));
        assert!(poll_reply(reply(0, "CAPCHA_NOT_READY")).unwrap().is_none());
        assert!(matches!(
            poll_reply(reply(0, "ERROR_CAPTCHA_UNSOLVABLE")),
            Err(CaptchaError::Unsolvable(_))
        ));
        let solved = poll_reply(reply(1, "x7k2")).unwrap().unwrap();
        assert_eq!(solved.token, "x7k2");
    }

    #[tokio::test]
    async fn empty_key_is_a_configuration_error() {
        let provider = TwoCaptchaProvider::new("");
        let err = provider
            .solve(&Challenge::static_image(b"png".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Configuration(_)));
    }
}
