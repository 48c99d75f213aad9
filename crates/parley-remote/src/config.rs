use url::Url;

/// Phoenix protocol version spoken on the realtime socket.
pub const REALTIME_VSN: &str = "1.0.0";

/// Where the hosted backend lives and the public key every request carries.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    base: Url,
    anon_key: String,
}

impl RemoteConfig {
    pub fn new(url: &str, anon_key: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(url)?;
        let trimmed = base.path().trim_end_matches('/').to_string();
        base.set_path(&trimmed);
        Ok(Self {
            base,
            anon_key: anon_key.into(),
        })
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// `path` under the base URL, e.g. `rest/v1/messages`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        self.endpoint(&format!("storage/v1/object/public/{}/{}", bucket, path))
    }

    /// Websocket URL for the realtime service, authenticated by the anon key.
    pub fn realtime_url(&self) -> Url {
        let mut url = self.base.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always a permitted scheme change.
        let _ = url.set_scheme(scheme);
        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", REALTIME_VSN);
        url
    }
}
