//! Datacenter identities and the known-DC table.

use tgnet_tl::mtproto::DcOption;

/// What a datacenter is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcType {
    Regular,
    Media,
    Cdn,
}

/// One datacenter endpoint. Immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataCenter {
    pub id: i32,
    pub kind: DcType,
    /// `ip:port`.
    pub addr: String,
    pub test: bool,
}

impl DataCenter {
    pub fn production(id: i32, addr: &str) -> Self {
        Self { id, kind: DcType::Regular, addr: addr.to_string(), test: false }
    }

    /// The default main DC (production DC 2).
    pub fn default_main() -> Self {
        Self::production(2, "149.154.167.51:443")
    }
}

/// An ordered set of known datacenters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DcOptions {
    options: Vec<DataCenter>,
}

impl DcOptions {
    pub fn new(options: Vec<DataCenter>) -> Self {
        Self { options }
    }

    /// The production bootstrap table, used until `help.getConfig` answers.
    pub fn bootstrap() -> Self {
        Self::new(vec![
            DataCenter::production(1, "149.154.175.53:443"),
            DataCenter::production(2, "149.154.167.51:443"),
            DataCenter::production(3, "149.154.175.100:443"),
            DataCenter::production(4, "149.154.167.91:443"),
            DataCenter::production(5, "91.108.56.130:443"),
        ])
    }

    pub fn find(&self, kind: DcType, id: i32) -> Option<&DataCenter> {
        self.options.iter().find(|dc| dc.kind == kind && dc.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataCenter> {
        self.options.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Merge a `help.getConfig` answer into the table. CDN and IPv6 entries
    /// are skipped; existing entries are replaced in place.
    pub fn apply_config(&mut self, options: &[DcOption], test: bool) {
        for opt in options {
            if opt.cdn() || opt.ipv6() || opt.tcpo_only() {
                continue;
            }
            let kind = if opt.media_only() { DcType::Media } else { DcType::Regular };
            let dc = DataCenter {
                id: opt.id,
                kind,
                addr: format!("{}:{}", opt.ip_address, opt.port),
                test,
            };
            match self
                .options
                .iter_mut()
                .find(|existing| existing.kind == kind && existing.id == opt.id)
            {
                Some(existing) => *existing = dc,
                None => self.options.push(dc),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_has_the_default_main() {
        let options = DcOptions::bootstrap();
        let main = DataCenter::default_main();
        assert_eq!(options.find(DcType::Regular, 2), Some(&main));
        assert!(options.find(DcType::Media, 2).is_none());
    }

    #[test]
    fn apply_config_inserts_and_replaces() {
        let mut options = DcOptions::bootstrap();
        options.apply_config(
            &[
                DcOption { flags: 0, id: 2, ip_address: "1.2.3.4".into(), port: 443 },
                DcOption { flags: 1 << 3, id: 9, ip_address: "5.6.7.8".into(), port: 443 },
            ],
            false,
        );
        assert_eq!(options.find(DcType::Regular, 2).unwrap().addr, "1.2.3.4:443");
        assert!(options.find(DcType::Regular, 9).is_none(), "cdn entries are skipped");
    }
}
