//! HTTP access to the tile server and the attribute API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parcel_core::fetch::{Transport, TransportError};
use parcel_tile_utils::{TileCoord, TileScheme};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use url::{Url, form_urlencoded};

use crate::config::{ConfigFileError, ConfigFileResult, EnrichConfig, TilesConfig};
use crate::{ParcelMapError, ParcelMapResult};

const USER_AGENT: &str = concat!("parcelmap/", env!("CARGO_PKG_VERSION"));
const PARCEL_ID: &str = "{parcel_id}";

fn header_map(headers: &BTreeMap<String, String>) -> ConfigFileResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigFileError::InvalidHeader(name.clone()))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|_| ConfigFileError::InvalidHeader(name.to_string()))?;
        value.set_sensitive(name == AUTHORIZATION);
        map.insert(name, value);
    }
    Ok(map)
}

fn client(headers: &BTreeMap<String, String>) -> ParcelMapResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(header_map(headers)?)
        .build()
        .map_err(ParcelMapError::HttpClientError)
}

fn request_error(e: &reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else if e.is_decode() {
        TransportError::Malformed(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<(StatusCode, Vec<u8>), TransportError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(&e))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|e| request_error(&e))?;
    Ok((status, body.to_vec()))
}

/// Fetches vector tiles from a `{z}/{x}/{y}` URL template.
#[derive(Debug, Clone)]
pub struct HttpTileTransport {
    client: reqwest::Client,
    url_template: String,
    scheme: TileScheme,
}

impl HttpTileTransport {
    pub fn new(
        url_template: impl Into<String>,
        scheme: TileScheme,
        headers: &BTreeMap<String, String>,
    ) -> ParcelMapResult<Self> {
        Ok(Self {
            client: client(headers)?,
            url_template: url_template.into(),
            scheme,
        })
    }

    pub fn from_config(config: &TilesConfig) -> ParcelMapResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or(ConfigFileError::MissingSetting("tiles.url"))?;
        Self::new(url, config.scheme.unwrap_or_default(), &config.headers)
    }

    /// URL of a tile, with the row numbered as the server expects.
    #[must_use]
    pub fn tile_url(&self, tile: TileCoord) -> String {
        self.url_template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.row_in(self.scheme).to_string())
    }
}

#[async_trait]
impl Transport for HttpTileTransport {
    type Request = TileCoord;

    /// `204 No Content` and `404 Not Found` are empty tiles: servers answer them for tiles
    /// without any parcel.
    async fn fetch(&self, tile: &TileCoord) -> Result<Vec<u8>, TransportError> {
        let (status, body) = get(&self.client, &self.tile_url(*tile)).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => Ok(body),
            status => Err(TransportError::Status(status.as_u16())),
        }
    }
}

/// Fetches the attributes of one parcel from a `{parcel_id}` URL template.
///
/// The id is percent-encoded for the part of the URL it lands in: as a path segment, or as a
/// query value when the placeholder follows the `?`.
#[derive(Debug, Clone)]
pub struct HttpApiTransport {
    client: reqwest::Client,
    url_template: String,
    id_in_query: bool,
    /// The template with a dummy id; its path is reused to encode path segments.
    sample: Url,
}

impl HttpApiTransport {
    pub fn new(
        url_template: impl Into<String>,
        headers: &BTreeMap<String, String>,
    ) -> ParcelMapResult<Self> {
        let url_template = url_template.into();
        let invalid = |reason: String| ConfigFileError::InvalidSetting("enrich.url".to_string(), reason);
        let sample = Url::parse(&url_template.replace(PARCEL_ID, "0"))
            .map_err(|e| invalid(format!("{url_template} is not a valid URL: {e}")))?;
        if sample.cannot_be_a_base() {
            return Err(invalid(format!("{url_template} is not an HTTP URL")).into());
        }
        let id_in_query = url_template
            .find(PARCEL_ID)
            .zip(url_template.find('?'))
            .is_some_and(|(id, query)| id > query);
        Ok(Self {
            client: client(headers)?,
            url_template,
            id_in_query,
            sample,
        })
    }

    pub fn from_config(config: &EnrichConfig) -> ParcelMapResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or(ConfigFileError::MissingSetting("enrich.url"))?;
        Self::new(url, &config.headers)
    }

    #[must_use]
    pub fn parcel_url(&self, parcel_id: &str) -> String {
        self.url_template
            .replace(PARCEL_ID, &self.encode_parcel_id(parcel_id))
    }

    fn encode_parcel_id(&self, parcel_id: &str) -> String {
        if self.id_in_query {
            return form_urlencoded::byte_serialize(parcel_id.as_bytes()).collect();
        }
        let mut url = self.sample.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().push(parcel_id);
        }
        url.path().trim_start_matches('/').to_string()
    }
}

#[async_trait]
impl Transport for HttpApiTransport {
    type Request = String;

    async fn fetch(&self, parcel_id: &String) -> Result<Vec<u8>, TransportError> {
        let (status, body) = get(&self.client, &self.parcel_url(parcel_id)).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_urls() {
        let xyz = HttpTileTransport::new(
            "https://tiles.example.org/{z}/{x}/{y}.pbf?key=abc",
            TileScheme::Xyz,
            &BTreeMap::new(),
        )
        .unwrap();
        let tile = TileCoord { z: 3, x: 5, y: 1 };
        assert_eq!(
            xyz.tile_url(tile),
            "https://tiles.example.org/3/5/1.pbf?key=abc"
        );

        let tms =
            HttpTileTransport::new("http://localhost/{z}/{x}/{y}", TileScheme::Tms, &BTreeMap::new())
                .unwrap();
        assert_eq!(tms.tile_url(tile), "http://localhost/3/5/6");
    }

    #[test]
    fn parcel_urls() {
        let api =
            HttpApiTransport::new("http://localhost/parcels/{parcel_id}/rules", &BTreeMap::new())
                .unwrap();
        assert_eq!(
            api.parcel_url("0281-014"),
            "http://localhost/parcels/0281-014/rules"
        );
    }

    #[test]
    fn parcel_ids_are_percent_encoded() {
        let in_path =
            HttpApiTransport::new("https://api.example.org/parcels/{parcel_id}/rules", &BTreeMap::new())
                .unwrap();
        assert_eq!(
            in_path.parcel_url("A/1 #2"),
            "https://api.example.org/parcels/A%2F1%20%232/rules"
        );
        assert_eq!(
            in_path.parcel_url("50%?"),
            "https://api.example.org/parcels/50%25%3F/rules"
        );

        let in_query = HttpApiTransport::new(
            "https://api.example.org/rules?parcel={parcel_id}&format=json",
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(
            in_query.parcel_url("A/1 #2&b=c"),
            "https://api.example.org/rules?parcel=A%2F1+%232%26b%3Dc&format=json"
        );
    }

    #[test]
    fn api_url_must_be_http() {
        for template in ["parcels/{parcel_id}", "mailto:{parcel_id}@example.org"] {
            assert!(matches!(
                HttpApiTransport::new(template, &BTreeMap::new()),
                Err(ParcelMapError::ConfigFileError(ConfigFileError::InvalidSetting(setting, _)))
                    if setting == "enrich.url"
            ));
        }
    }

    #[test]
    fn headers() {
        let headers = BTreeMap::from([
            ("Authorization".to_string(), "Bearer abc".to_string()),
            ("X-Api-Key".to_string(), "123".to_string()),
        ]);
        let map = header_map(&headers).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map["authorization"].is_sensitive());

        let bad = BTreeMap::from([("Bad Header".to_string(), "x".to_string())]);
        assert!(matches!(
            header_map(&bad),
            Err(ConfigFileError::InvalidHeader(name)) if name == "Bad Header"
        ));
        let bad = BTreeMap::from([("X-Ok".to_string(), "line\nbreak".to_string())]);
        assert!(matches!(
            header_map(&bad),
            Err(ConfigFileError::InvalidHeader(name)) if name == "x-ok"
        ));
    }
}
