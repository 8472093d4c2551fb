use anyhow::Result;
use log::info;

use super::Advertiser;
use crate::config::Config;

/// Stand-in advertiser: logs the `_raop._tcp` instance it would publish.
/// The TXT record set is what iTunes expects from a RAOP v1 endpoint.
pub struct LogAdvertiser {
    instance: String,
    port: u16,
    txt: Vec<String>,
}

impl LogAdvertiser {
    pub fn new(config: &Config) -> Self {
        let hw_addr = config.hw_addr.iter().map(|x| format!("{:02X}", x)).collect::<String>();

        let txt = vec![
            "txtvers=1".into(), // always 1
            "md=0,1,2".into(),  // metadata type
            "ss=16".into(),     // sample size
            "sr=44100".into(),  // sample rate
            "ch=2".into(),      // channels
            "et=0,1".into(),    // encryption type
            "cn=0,1".into(),    // codec type
            format!("pw={}", config.password.is_some()),
            "tp=UDP".into(), // transport protocol
            "vn=65537".into(),
        ];

        Self {
            instance: format!("{}@{}", hw_addr, config.name),
            port: config.port,
            txt,
        }
    }
}

impl Advertiser for LogAdvertiser {
    fn register(&self) -> Result<()> {
        info!(
            "advertising _raop._tcp instance {} on port {} [{}]",
            self.instance,
            self.port,
            self.txt.join(" ")
        );

        Ok(())
    }
}
