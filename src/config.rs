use eyre::Result;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Namespace whose network policies to watch instead of the whole
    /// cluster. Pods and namespaces are always watched cluster-wide.
    pub namespace: Option<String>,

    /// Kubernetes API server URL
    pub cluster_url: Option<String>,

    /// Northbound database address (`tcp:host:port` or `unix:/path`).
    #[serde(default = "default_nb_address")]
    pub nb_address: String,
}

fn default_nb_address() -> String {
    "unix:/var/run/ovn/ovnnb_db.sock".into()
}

impl Config {
    /// parse the cluster_url
    pub fn cluster_url(&self) -> Result<Option<http::Uri>> {
        match self.cluster_url {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }
}
