use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{KnittyError, Result as KResult};

pub const SECTOR_ID_LEN: usize = 12;
pub const SECTOR_DATA_LEN: usize = 1024;
pub const SECTOR_COUNT: usize = 80;

/// One addressable unit of the disk: a 12-byte identifier and 1024 bytes
/// of payload.
#[derive(Clone)]
pub struct Sector {
    pub id: [u8; SECTOR_ID_LEN],
    pub data: [u8; SECTOR_DATA_LEN],
}

impl Sector {
    const EMPTY: Sector = Sector {
        id: [0; SECTOR_ID_LEN],
        data: [0; SECTOR_DATA_LEN],
    };
}

/// An 80-sector disk. The first 32 sectors double as the machine's 32 KiB
/// pattern memory when concatenated; see [`crate::orchestrator`].
pub struct Disk {
    sectors: Box<[Sector; SECTOR_COUNT]>,
}

#[derive(Serialize, Deserialize)]
struct SectorDto {
    id: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct DiskDto {
    sectors: Vec<SectorDto>,
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk {
    pub fn new() -> Self {
        Disk {
            sectors: Box::new([Sector::EMPTY; SECTOR_COUNT]),
        }
    }

    pub fn sectors(&self) -> &[Sector; SECTOR_COUNT] {
        &self.sectors
    }

    /// Linear scan for the first sector whose id matches `id`.
    pub fn index_of_id(&self, id: &[u8; SECTOR_ID_LEN]) -> Option<usize> {
        self.sectors.iter().position(|sector| &sector.id == id)
    }

    pub fn sector_id(&self, index: usize) -> KResult<&[u8; SECTOR_ID_LEN]> {
        self.sectors
            .get(index)
            .map(|s| &s.id)
            .ok_or(KnittyError::SectorIndexOutOfBounds(index, SECTOR_COUNT))
    }

    pub fn sector_data(&self, index: usize) -> KResult<&[u8; SECTOR_DATA_LEN]> {
        self.sectors
            .get(index)
            .map(|s| &s.data)
            .ok_or(KnittyError::SectorIndexOutOfBounds(index, SECTOR_COUNT))
    }

    pub fn set_sector_id(&mut self, index: usize, id: [u8; SECTOR_ID_LEN]) -> KResult<()> {
        let sector = self
            .sectors
            .get_mut(index)
            .ok_or(KnittyError::SectorIndexOutOfBounds(index, SECTOR_COUNT))?;
        sector.id = id;
        Ok(())
    }

    pub fn set_sector_data(&mut self, index: usize, data: [u8; SECTOR_DATA_LEN]) -> KResult<()> {
        let sector = self
            .sectors
            .get_mut(index)
            .ok_or(KnittyError::SectorIndexOutOfBounds(index, SECTOR_COUNT))?;
        sector.data = data;
        Ok(())
    }

    /// Concatenate the `data` of the first `n` sectors into one buffer of
    /// length `1024 * n`.
    pub fn concat_sectors(&self, n: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(SECTOR_DATA_LEN * n);
        for sector in self.sectors.iter().take(n) {
            data.extend(sector.data);
        }
        data
    }

    /// Chunk `data` into 1024-byte sectors starting from index 0. Every
    /// touched sector's id becomes `0x01 ‖ 0x00×11`.
    pub fn scatter(&mut self, data: &[u8]) {
        for (i, chunk) in data.chunks(SECTOR_DATA_LEN).enumerate() {
            let mut sector_data = [0; SECTOR_DATA_LEN];
            sector_data[..chunk.len()].copy_from_slice(chunk);

            let mut id = [0; SECTOR_ID_LEN];
            id[0] = 0x01;

            self.sectors[i].data = sector_data;
            self.sectors[i].id = id;
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let f = BufReader::new(File::open(path)?);
        let dto: DiskDto = serde_json::from_reader(f).context("Could not parse disk JSON")?;

        if dto.sectors.len() != SECTOR_COUNT {
            return Err(KnittyError::WrongSize {
                what: "disk sector list",
                expected: SECTOR_COUNT,
                got: dto.sectors.len(),
            }
            .into());
        }

        for (sector, dto_sector) in self.sectors.iter_mut().zip(dto.sectors.iter()) {
            let id = BASE64
                .decode(&dto_sector.id)
                .context("Invalid base64 in sector id")?;
            let data = BASE64
                .decode(&dto_sector.data)
                .context("Invalid base64 in sector data")?;

            if id.len() != SECTOR_ID_LEN {
                return Err(KnittyError::WrongSize {
                    what: "sector id",
                    expected: SECTOR_ID_LEN,
                    got: id.len(),
                }
                .into());
            }
            if data.len() != SECTOR_DATA_LEN {
                return Err(KnittyError::WrongSize {
                    what: "sector data",
                    expected: SECTOR_DATA_LEN,
                    got: data.len(),
                }
                .into());
            }

            sector.id.copy_from_slice(&id);
            sector.data.copy_from_slice(&data);
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dto = DiskDto {
            sectors: self
                .sectors
                .iter()
                .map(|sector| SectorDto {
                    id: BASE64.encode(sector.id),
                    data: BASE64.encode(sector.data),
                })
                .collect(),
        };

        let f = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(f, &dto).context("Could not write disk JSON")?;

        Ok(())
    }
}

#[test]
fn scatter_then_concat_is_identity() {
    let mut disk = Disk::new();
    let original: Vec<u8> = (0..SECTOR_DATA_LEN * 32)
        .map(|i| (i % 256) as u8)
        .collect();

    disk.scatter(&original);
    let round_tripped = disk.concat_sectors(32);

    assert_eq!(round_tripped, original);
    for sector in disk.sectors().iter().take(32) {
        assert_eq!(sector.id[0], 0x01);
        assert_eq!(&sector.id[1..], &[0; SECTOR_ID_LEN - 1]);
    }
}

#[test]
fn index_of_id_finds_and_misses() {
    let mut disk = Disk::new();
    let mut id = [0; SECTOR_ID_LEN];
    id.copy_from_slice(b"HELLO_WORLD!");
    disk.set_sector_id(3, id).unwrap();

    assert_eq!(disk.index_of_id(&id), Some(3));

    let mut missing = [0; SECTOR_ID_LEN];
    missing.copy_from_slice(b"????????????");
    assert_eq!(disk.index_of_id(&missing), None);
}

#[test]
fn json_round_trip_preserves_disk() {
    let mut disk = Disk::new();
    disk.scatter(&vec![0xab; SECTOR_DATA_LEN * 5]);
    disk.set_sector_id(10, *b"HELLO_WORLD!").unwrap();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("knitty2-test-disk-{}.json", std::process::id()));

    disk.save(&path).unwrap();

    let mut loaded = Disk::new();
    loaded.load(&path).unwrap();

    std::fs::remove_file(&path).ok();

    for (a, b) in disk.sectors().iter().zip(loaded.sectors().iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.data, b.data);
    }
}

#[test]
fn sector_index_out_of_bounds_is_an_error() {
    let disk = Disk::new();
    assert!(disk.sector_id(SECTOR_COUNT).is_err());
    assert!(disk.sector_data(SECTOR_COUNT).is_err());
}
