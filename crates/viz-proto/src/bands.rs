use serde::ser::{Serialize, SerializeMap, Serializer};

/// Number of bands in every [`BandVector`].
pub const BAND_COUNT: usize = 25;

/// One frequency band.  `index` is 1-based and matches the `bucketN` wire key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandDefinition {
    pub index: usize,
    pub low_hz: f32,
    pub high_hz: f32,
    pub gain: f32,
}

impl BandDefinition {
    const fn new(index: usize, low_hz: f32, high_hz: f32, gain: f32) -> Self {
        Self {
            index,
            low_hz,
            high_hz,
            gain,
        }
    }

    /// True when `hz` falls inside `[low_hz, high_hz)`.
    pub fn contains(&self, hz: f32) -> bool {
        hz >= self.low_hz && hz < self.high_hz
    }
}

// ── static table ──────────────────────────────────────────────────────────────

// Half-open ranges, roughly third-octave from sub-bass to 20 kHz.  Gains rise
// with frequency to offset the high-end roll-off of music.
static BANDS: [BandDefinition; BAND_COUNT] = [
    // Sub-bass and bass
    BandDefinition::new(1, 20.0, 40.0, 1.0),
    BandDefinition::new(2, 40.0, 60.0, 1.0),
    BandDefinition::new(3, 60.0, 90.0, 1.2),
    BandDefinition::new(4, 90.0, 120.0, 1.2),
    BandDefinition::new(5, 120.0, 160.0, 1.5),
    // Low midrange
    BandDefinition::new(6, 160.0, 200.0, 1.5),
    BandDefinition::new(7, 200.0, 250.0, 1.5),
    BandDefinition::new(8, 250.0, 315.0, 1.8),
    BandDefinition::new(9, 315.0, 400.0, 1.8),
    BandDefinition::new(10, 400.0, 500.0, 2.0),
    // Midrange
    BandDefinition::new(11, 500.0, 630.0, 2.0),
    BandDefinition::new(12, 630.0, 800.0, 2.2),
    BandDefinition::new(13, 800.0, 1000.0, 2.2),
    BandDefinition::new(14, 1000.0, 1250.0, 2.5),
    BandDefinition::new(15, 1250.0, 1600.0, 2.5),
    // Upper midrange
    BandDefinition::new(16, 1600.0, 2000.0, 2.8),
    BandDefinition::new(17, 2000.0, 2500.0, 3.0),
    BandDefinition::new(18, 2500.0, 3150.0, 3.0),
    BandDefinition::new(19, 3150.0, 4000.0, 3.5),
    BandDefinition::new(20, 4000.0, 5000.0, 4.0),
    // Presence and brilliance
    BandDefinition::new(21, 5000.0, 6300.0, 4.5),
    BandDefinition::new(22, 6300.0, 8000.0, 5.0),
    BandDefinition::new(23, 8000.0, 10000.0, 5.5),
    BandDefinition::new(24, 10000.0, 12500.0, 6.0),
    BandDefinition::new(25, 12500.0, 20000.0, 6.5),
];

/// Read-only view over the band layout.
#[derive(Debug, Clone, Copy)]
pub struct BandTable {
    bands: &'static [BandDefinition; BAND_COUNT],
}

impl Default for BandTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl BandTable {
    pub fn standard() -> Self {
        Self { bands: &BANDS }
    }

    pub fn bands(&self) -> &'static [BandDefinition; BAND_COUNT] {
        self.bands
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static BandDefinition> {
        self.bands.iter()
    }

    /// Check the structural invariants of the table.
    ///
    /// Indices must run 1..=N in order, every range must be non-empty with a
    /// positive gain, and ranges must be ascending and pairwise disjoint.
    pub fn validate(&self) -> Result<(), String> {
        let mut prev: Option<&BandDefinition> = None;
        for (pos, band) in self.bands.iter().enumerate() {
            if band.index != pos + 1 {
                return Err(format!(
                    "band at position {} has index {}",
                    pos, band.index
                ));
            }
            if !(band.low_hz < band.high_hz) {
                return Err(format!("band {} has an empty range", band.index));
            }
            if !(band.gain > 0.0) {
                return Err(format!("band {} has non-positive gain", band.index));
            }
            if let Some(p) = prev {
                if band.low_hz < p.high_hz {
                    return Err(format!(
                        "band {} overlaps band {}",
                        band.index, p.index
                    ));
                }
            }
            prev = Some(band);
        }
        Ok(())
    }
}

// ── band vector ───────────────────────────────────────────────────────────────

/// One magnitude per band, same order as the table.
///
/// `Copy` so it can be published whole from the audio callback without
/// touching the allocator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandVector(pub [f32; BAND_COUNT]);

impl Default for BandVector {
    fn default() -> Self {
        Self::silent()
    }
}

impl BandVector {
    pub const fn silent() -> Self {
        Self([0.0; BAND_COUNT])
    }

    pub fn values(&self) -> &[f32; BAND_COUNT] {
        &self.0
    }

    /// Value for the 1-based band index.
    pub fn band(&self, index: usize) -> Option<f32> {
        index.checked_sub(1).and_then(|i| self.0.get(i).copied())
    }

    pub fn is_silent(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

/// Serialises as `{"bucket1": f64, ..., "bucket25": f64}`.
impl Serialize for BandVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(BAND_COUNT))?;
        for (i, value) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("bucket{}", i + 1), &f64::from(*value))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_is_valid() {
        let table = BandTable::standard();
        assert_eq!(table.bands().len(), BAND_COUNT);
        table.validate().unwrap();
    }

    #[test]
    fn test_bands_are_ascending_and_disjoint() {
        let bands = BandTable::standard().bands();
        for pair in bands.windows(2) {
            assert!(pair[0].index < pair[1].index);
            assert!(pair[0].high_hz <= pair[1].low_hz);
        }
    }

    #[test]
    fn test_contains_is_half_open() {
        let band = BandTable::standard().bands()[0];
        assert!(band.contains(20.0));
        assert!(band.contains(39.99));
        assert!(!band.contains(40.0));
        assert!(!band.contains(19.99));
    }

    #[test]
    fn test_band_vector_serialises_bucket_keys() {
        let mut v = BandVector::silent();
        v.0[0] = 1.5;
        v.0[24] = 2.25;
        let json = serde_json::to_value(v).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), BAND_COUNT);
        assert_eq!(obj["bucket1"].as_f64(), Some(1.5));
        assert_eq!(obj["bucket25"].as_f64(), Some(2.25));
        assert_eq!(obj["bucket13"].as_f64(), Some(0.0));
    }

    #[test]
    fn test_band_lookup_is_one_based() {
        let mut v = BandVector::silent();
        v.0[2] = 3.0;
        assert_eq!(v.band(3), Some(3.0));
        assert_eq!(v.band(0), None);
        assert_eq!(v.band(26), None);
    }
}
