//! Bridges the 32 KiB KH-940 memory image to the first 32 sectors of a
//! [`Disk`], and back. Runs once at startup (disk → state) and once at
//! shutdown (state → disk).

use crate::disk::Disk;
use crate::error::Result;
use crate::kh940::MachineState;

const PATTERN_MEMORY_SECTORS: usize = 32;

/// Serialize `state` and scatter it over the first 32 sectors of `disk`.
pub fn state_to_disk(state: &mut MachineState, disk: &mut Disk) {
    let image = state.serialize();
    disk.scatter(&image);
}

/// Concatenate the first 32 sectors of `disk` and parse them into a
/// [`MachineState`].
pub fn disk_to_state(disk: &Disk) -> Result<MachineState> {
    let image = disk.concat_sectors(PATTERN_MEMORY_SECTORS);
    MachineState::from_memory_dump(&image)
}

#[cfg(test)]
use crate::kh940::Pattern;

#[test]
fn round_trips_through_a_disk() {
    let mut state = MachineState::empty();
    state
        .add_pattern(Pattern::new(7, 4, 2, vec![vec![true, false, true, false]; 2], None).unwrap())
        .unwrap();

    let mut disk = Disk::new();
    state_to_disk(&mut state, &mut disk);

    let parsed = disk_to_state(&disk).unwrap();
    assert_eq!(parsed.patterns().len(), 1);
    assert_eq!(parsed.patterns()[0].pattern_number(), 7);

    for sector in disk.sectors().iter().take(32) {
        assert_eq!(sector.id[0], 0x01);
    }
    for sector in disk.sectors().iter().skip(32) {
        assert_eq!(sector.id, [0; 12]);
    }
}
