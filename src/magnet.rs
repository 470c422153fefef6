//! Handle magnet link
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, metainfo::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(Magnet_);

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        Ok(Self(
            Magnet_::new(magnet_url).map_err(|_| Error::MagnetLinkInvalid)?,
        ))
    }

    /// The name comes URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        if let Some(dn) = self.0.display_name() {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.to_string();
            }
        }
        "Unknown".to_owned()
    }

    /// Transform the "xt" field from hex to the binary info hash.
    pub fn parse_xt_infohash(&self) -> Result<InfoHash, Error> {
        let hash = self.0.hash().clone().ok_or(Error::MagnetNoInfoHash)?;
        let bytes = hex::decode(hash).map_err(|_| Error::MagnetNoInfoHash)?;
        InfoHash::try_from(bytes).map_err(|_| Error::MagnetNoInfoHash)
    }

    /// The length in bytes of the file, when the link carries an "xl".
    pub fn length(&self) -> Option<u64> {
        self.0.length()
    }

    /// Announce urls of the magnet, udp, http and https schemes only.
    pub fn parse_trackers(&self) -> Vec<String> {
        self.0
            .trackers()
            .iter()
            .filter_map(|tr| urlencoding::decode(tr).ok())
            .map(|tr| tr.to_string())
            .filter(|tr| {
                tr.starts_with("udp://")
                    || tr.starts_with("http://")
                    || tr.starts_with("https://")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_string_to_magnet() {
        let mstr = "magnet:?xt=urn:btih:9f9165d9a281a9b8e782cd5176bbcc8256fd1871\
                    &dn=My%20Torrent\
                    &xl=12345\
                    &tr=udp%3A%2F%2Ftracker.example.com%3A6969%2Fannounce\
                    &tr=https%3A%2F%2Ftracker2.example.com%2Fannounce";
        let magnet = Magnet::new(mstr).unwrap();

        assert_eq!(magnet.parse_dn(), "My Torrent");
        assert_eq!(magnet.length(), Some(12345));
        assert_eq!(
            magnet.parse_xt_infohash().unwrap().to_string(),
            "9f9165d9a281a9b8e782cd5176bbcc8256fd1871"
        );

        let trackers = magnet.parse_trackers();
        assert_eq!(
            trackers,
            vec![
                "udp://tracker.example.com:6969/announce".to_owned(),
                "https://tracker2.example.com/announce".to_owned(),
            ]
        );
    }

    #[test]
    fn magnet_without_info_hash() {
        assert!(Magnet::new("https://example.com").is_err());
    }
}
