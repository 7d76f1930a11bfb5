use serde::Deserialize;

/// The software identity announced in version numerics and handshakes.
#[derive(Clone,Debug,Deserialize)]
pub struct Software
{
    pub name: String,
    pub version: String,
}

impl Default for Software
{
    fn default() -> Self
    {
        Self {
            name: "dc-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl std::fmt::Display for Software
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[derive(Clone,Debug,Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct HubConfig
{
    /// Display name, used in welcome text across all protocols.
    pub name: String,

    /// One-line description announced to ADC clients.
    #[serde(default)]
    pub desc: String,

    /// Message shown to users entering the main chat.
    #[serde(default)]
    pub motd: String,

    #[serde(default)]
    pub soft: Software,
}

impl Default for HubConfig
{
    fn default() -> Self
    {
        Self {
            name: "DC Hub".to_string(),
            desc: String::new(),
            motd: String::new(),
            soft: Software::default(),
        }
    }
}
