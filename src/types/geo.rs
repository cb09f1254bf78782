// src/types/geo.rs

//! # Geospatial Support
//!
//! A geo set is a sorted set whose scores are 52-bit geohashes: 26 bits of
//! latitude interleaved with 26 bits of longitude. Positions read back from a
//! set are the centres of their geohash cells, so every distance between two
//! members is computed on the decoded coordinates.
//!
//! Distances use the haversine formula on a sphere of radius 6372797.560856 m.
//!
//! Supported commands:
//! - `GEOADD`
//! - `GEODIST`
//! - `GEOPOS`
//! - `GEOSEARCH` (`FROMMEMBER` / `FROMLONLAT`, `BYRADIUS` / `BYBOX`)

use ordered_float::OrderedFloat;

use crate::engine::keyspace::Shard;
use crate::error::{Result, StoreError};

const GEO_STEP: u32 = 26;
const LON_MIN: f64 = -180.0;
const LON_MAX: f64 = 180.0;
const LAT_MIN: f64 = -85.051_128_78;
const LAT_MAX: f64 = 85.051_128_78;
const EARTH_RADIUS_M: f64 = 6_372_797.560_856;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl DistanceUnit {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        match raw.to_ascii_lowercase().as_slice() {
            b"m" => Ok(DistanceUnit::Meters),
            b"km" => Ok(DistanceUnit::Kilometers),
            b"mi" => Ok(DistanceUnit::Miles),
            b"ft" => Ok(DistanceUnit::Feet),
            _ => Err(StoreError::Syntax),
        }
    }

    /// Length of one unit in meters.
    pub fn meters(self) -> f64 {
        match self {
            DistanceUnit::Meters => 1.0,
            DistanceUnit::Kilometers => 1000.0,
            DistanceUnit::Miles => 1609.34,
            DistanceUnit::Feet => 0.3048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    /// Validates the pair against the range a geohash can represent.
    pub fn new(lon: f64, lat: f64) -> Result<Self> {
        if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
            return Err(StoreError::InvalidCoordinates(OrderedFloat(lon), OrderedFloat(lat)));
        }
        Ok(GeoPoint { lon, lat })
    }
}

/// Spreads the low 32 bits of `v` over the even bit positions.
fn spread(v: u32) -> u64 {
    (0..32).fold(0u64, |acc, i| acc | (u64::from((v >> i) & 1) << (2 * i)))
}

/// Inverse of [`spread`].
fn squash(v: u64) -> u32 {
    (0..32).fold(0u32, |acc, i| acc | (((v >> (2 * i)) & 1) as u32) << i)
}

fn cell(value: f64, min: f64, max: f64) -> u32 {
    let scale = (1u64 << GEO_STEP) as f64;
    let offset = ((value - min) / (max - min) * scale) as u64;
    offset.min((1 << GEO_STEP) - 1) as u32
}

/// Interleaved 52-bit geohash; latitude takes the even bits.
pub fn encode(p: GeoPoint) -> u64 {
    spread(cell(p.lat, LAT_MIN, LAT_MAX)) | (spread(cell(p.lon, LON_MIN, LON_MAX)) << 1)
}

/// Centre of the geohash cell.
pub fn decode(hash: u64) -> GeoPoint {
    let scale = (1u64 << GEO_STEP) as f64;
    let mid = |off: u32, min: f64, max: f64| min + (f64::from(off) + 0.5) / scale * (max - min);
    GeoPoint {
        lon: mid(squash(hash >> 1), LON_MIN, LON_MAX).clamp(LON_MIN, LON_MAX),
        lat: mid(squash(hash), LAT_MIN, LAT_MAX).clamp(LAT_MIN, LAT_MAX),
    }
}

/// Great-circle distance in meters.
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let u = ((lat2 - lat1) / 2.0).sin();
    let v = ((b.lon.to_radians() - a.lon.to_radians()) / 2.0).sin();
    let h = (u * u + lat1.cos() * lat2.cos() * v * v).clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeoOrigin {
    Member(Vec<u8>),
    LonLat(f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoShape {
    Radius { radius: f64, unit: DistanceUnit },
    Box { width: f64, height: f64, unit: DistanceUnit },
}

impl GeoShape {
    pub fn unit(&self) -> DistanceUnit {
        match self {
            GeoShape::Radius { unit, .. } | GeoShape::Box { unit, .. } => *unit,
        }
    }

    /// Distance from `center` in meters when `p` falls inside the shape.
    fn admit(&self, center: GeoPoint, p: GeoPoint) -> Option<f64> {
        let dist = distance_m(center, p);
        match *self {
            GeoShape::Radius { radius, unit } => (dist <= radius * unit.meters()).then_some(dist),
            GeoShape::Box { width, height, unit } => {
                let half_w = width * unit.meters() / 2.0;
                let half_h = height * unit.meters() / 2.0;
                let lat_span = EARTH_RADIUS_M * (p.lat.to_radians() - center.lat.to_radians()).abs();
                // east-west extent measured along the member's own parallel
                let lon_span = distance_m(GeoPoint { lon: center.lon, lat: p.lat }, p);
                (lat_span <= half_h && lon_span <= half_w).then_some(dist)
            }
        }
    }
}

/// A GEOSEARCH request.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoQuery {
    pub origin: GeoOrigin,
    pub shape: GeoShape,
    pub descending: bool,
    pub count: Option<usize>,
    pub with_dist: bool,
    pub with_coord: bool,
}

impl GeoQuery {
    pub fn new(origin: GeoOrigin, shape: GeoShape) -> Self {
        GeoQuery {
            origin,
            shape,
            descending: false,
            count: None,
            with_dist: false,
            with_coord: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoMatch {
    pub member: Vec<u8>,
    /// In the unit of the query shape.
    pub distance: f64,
    pub position: GeoPoint,
}

/// GEOADD key lon lat member [lon lat member ...]
/// Every pair is validated before anything is written.
pub fn geoadd(shard: &mut Shard, key: &[u8], items: &[(f64, f64, Vec<u8>)], now: u64) -> Result<usize> {
    let hashed = items
        .iter()
        .map(|(lon, lat, m)| GeoPoint::new(*lon, *lat).map(|p| (encode(p) as f64, m)))
        .collect::<Result<Vec<_>>>()?;
    let zset = shard.zset_or_create(key, now)?;
    Ok(hashed.into_iter().filter(|(score, m)| zset.insert(m, *score)).count())
}

fn position(shard: &mut Shard, key: &[u8], member: &[u8], now: u64) -> Result<Option<GeoPoint>> {
    Ok(shard
        .zset(key, now)?
        .and_then(|z| z.score(member))
        .map(|score| decode(score as u64)))
}

/// GEODIST key member1 member2 [unit]
/// `None` when either member is missing.
pub fn geodist(
    shard: &mut Shard,
    key: &[u8],
    a: &[u8],
    b: &[u8],
    unit: DistanceUnit,
    now: u64,
) -> Result<Option<f64>> {
    let (Some(pa), Some(pb)) = (position(shard, key, a, now)?, position(shard, key, b, now)?) else {
        return Ok(None);
    };
    Ok(Some(distance_m(pa, pb) / unit.meters()))
}

/// GEOPOS key member [member ...]
pub fn geopos(shard: &mut Shard, key: &[u8], members: &[Vec<u8>], now: u64) -> Result<Vec<Option<GeoPoint>>> {
    members.iter().map(|m| position(shard, key, m, now)).collect()
}

/// GEOSEARCH key <FROMMEMBER m | FROMLONLAT lon lat> <BYRADIUS r unit | BYBOX w h unit>
/// Results are ordered by distance (ties by member), nearest first unless
/// `descending`, then cut to `count`.
pub fn geosearch(shard: &mut Shard, key: &[u8], query: &GeoQuery, now: u64) -> Result<Vec<GeoMatch>> {
    let center = match &query.origin {
        GeoOrigin::LonLat(lon, lat) => GeoPoint::new(*lon, *lat)?,
        GeoOrigin::Member(m) => match position(shard, key, m, now)? {
            Some(p) => p,
            None => {
                // a missing key reads as an empty set
                return if shard.contains(key, now) {
                    Err(StoreError::MemberNotFound)
                } else {
                    Ok(Vec::new())
                };
            }
        },
    };
    let Some(zset) = shard.zset(key, now)? else {
        return Ok(Vec::new());
    };

    let to_unit = query.shape.unit().meters();
    let mut found: Vec<GeoMatch> = zset
        .iter()
        .filter_map(|(member, score)| {
            let p = decode(score as u64);
            query.shape.admit(center, p).map(|d| GeoMatch {
                member: member.to_vec(),
                distance: d / to_unit,
                position: p,
            })
        })
        .collect();

    // 方向只作用于距离，同距离的成员始终按字典序升序
    found.sort_by(|a, b| {
        let by_distance = OrderedFloat(a.distance).cmp(&OrderedFloat(b.distance));
        let by_distance = if query.descending { by_distance.reverse() } else { by_distance };
        by_distance.then_with(|| a.member.cmp(&b.member))
    });
    if let Some(n) = query.count {
        found.truncate(n);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sellers() -> Shard {
        let mut shard = Shard::default();
        geoadd(&mut shard, b"sellers", &[(106.820990, -6.174704, b"Toko A".to_vec())], 0).unwrap();
        geoadd(&mut shard, b"sellers", &[(106.822696, -6.176870, b"Toko B".to_vec())], 0).unwrap();
        shard
    }

    fn members(found: &[GeoMatch]) -> Vec<&str> {
        found
            .iter()
            .map(|m| std::str::from_utf8(&m.member).unwrap())
            .collect()
    }

    #[test]
    fn test_geohash_cell_contains_point() {
        for (lon, lat) in [(106.820990, -6.174704), (-122.4194, 37.7749), (0.0, 0.0), (179.9, -85.0)] {
            let p = decode(encode(GeoPoint::new(lon, lat).unwrap()));
            assert!((p.lon - lon).abs() < 1e-5, "lon {lon} -> {}", p.lon);
            assert!((p.lat - lat).abs() < 1e-5, "lat {lat} -> {}", p.lat);
        }
    }

    #[test]
    fn test_geodist_between_sellers() -> Result<()> {
        let mut shard = sellers();
        let km = geodist(&mut shard, b"sellers", b"Toko A", b"Toko B", DistanceUnit::Kilometers, 0)?;
        assert_eq!(format!("{:.4}", km.unwrap()), "0.3061");

        let m = geodist(&mut shard, b"sellers", b"Toko A", b"Toko B", DistanceUnit::Meters, 0)?.unwrap();
        assert!((m - 306.1).abs() < 0.1);
        assert_eq!(geodist(&mut shard, b"sellers", b"Toko A", b"nope", DistanceUnit::Meters, 0)?, None);
        Ok(())
    }

    #[test]
    fn test_geosearch_orders_by_distance() -> Result<()> {
        let mut shard = sellers();
        geoadd(&mut shard, b"sellers", &[(107.619123, -6.917464, b"Toko Bandung".to_vec())], 0)?;

        let shape = GeoShape::Radius { radius: 5.0, unit: DistanceUnit::Kilometers };
        let mut q = GeoQuery::new(GeoOrigin::LonLat(106.821666, -6.175494), shape);
        assert_eq!(members(&geosearch(&mut shard, b"sellers", &q, 0)?), ["Toko A", "Toko B"]);

        q.descending = true;
        assert_eq!(members(&geosearch(&mut shard, b"sellers", &q, 0)?), ["Toko B", "Toko A"]);
        q.count = Some(1);
        assert_eq!(members(&geosearch(&mut shard, b"sellers", &q, 0)?), ["Toko B"]);

        let from_member = GeoQuery::new(GeoOrigin::Member(b"Toko A".to_vec()), shape);
        let found = geosearch(&mut shard, b"sellers", &from_member, 0)?;
        assert_eq!(members(&found), ["Toko A", "Toko B"]);
        assert_eq!(found[0].distance, 0.0);
        assert_eq!(format!("{:.4}", found[1].distance), "0.3061");
        Ok(())
    }

    #[test]
    fn test_descending_keeps_member_order_on_ties() -> Result<()> {
        let mut shard = sellers();
        // 与 Toko A 同一坐标，距离完全相同
        geoadd(&mut shard, b"sellers", &[(106.820990, -6.174704, b"Toko D".to_vec())], 0)?;
        geoadd(&mut shard, b"sellers", &[(106.820990, -6.174704, b"Toko C".to_vec())], 0)?;

        let shape = GeoShape::Radius { radius: 5.0, unit: DistanceUnit::Kilometers };
        let mut q = GeoQuery::new(GeoOrigin::Member(b"Toko B".to_vec()), shape);
        assert_eq!(
            members(&geosearch(&mut shard, b"sellers", &q, 0)?),
            ["Toko B", "Toko A", "Toko C", "Toko D"]
        );

        q.descending = true;
        assert_eq!(
            members(&geosearch(&mut shard, b"sellers", &q, 0)?),
            ["Toko A", "Toko C", "Toko D", "Toko B"]
        );
        q.count = Some(2);
        assert_eq!(members(&geosearch(&mut shard, b"sellers", &q, 0)?), ["Toko A", "Toko C"]);
        Ok(())
    }

    #[test]
    fn test_geosearch_by_box() -> Result<()> {
        let mut shard = sellers();
        let center = GeoOrigin::LonLat(106.821666, -6.175494);
        // ~220 m east-west, ~40 m north-south: both shops are too far north/south
        let narrow = GeoShape::Box { width: 220.0, height: 40.0, unit: DistanceUnit::Meters };
        assert!(geosearch(&mut shard, b"sellers", &GeoQuery::new(center.clone(), narrow), 0)?.is_empty());

        let wide = GeoShape::Box { width: 1.0, height: 1.0, unit: DistanceUnit::Kilometers };
        let found = geosearch(&mut shard, b"sellers", &GeoQuery::new(center, wide), 0)?;
        assert_eq!(members(&found), ["Toko A", "Toko B"]);
        Ok(())
    }

    #[test]
    fn test_invalid_input() {
        let mut shard = sellers();
        let err = geoadd(&mut shard, b"sellers", &[(200.0, 1.0, b"x".to_vec())], 0).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCoordinates(..)));
        assert!(matches!(
            geoadd(&mut shard, b"sellers", &[(0.0, 86.0, b"x".to_vec())], 0),
            Err(StoreError::InvalidCoordinates(..))
        ));

        let shape = GeoShape::Radius { radius: 1.0, unit: DistanceUnit::Meters };
        let q = GeoQuery::new(GeoOrigin::Member(b"ghost".to_vec()), shape);
        assert_eq!(geosearch(&mut shard, b"sellers", &q, 0), Err(StoreError::MemberNotFound));
        assert_eq!(geosearch(&mut shard, b"nothing", &q, 0), Ok(Vec::new()));
        assert_eq!(DistanceUnit::parse(b"KM"), Ok(DistanceUnit::Kilometers));
        assert_eq!(DistanceUnit::parse(b"yards"), Err(StoreError::Syntax));
    }
}
