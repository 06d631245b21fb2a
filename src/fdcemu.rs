use std::{
    convert::Infallible,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{bail, ensure, Result};
use serial::{PortSettings, SerialPort};
use tracing::{debug, trace};

use crate::disk::Disk;

enum FdcMode {
    Op,
    Fdc,
}

/// The two-mode serial state machine: a long-running consumer of bytes
/// from `port`, dispatching against the bound `disk`.
///
/// Generic over any `Read + Write` so tests can drive it with an in-memory
/// duplex instead of a real serial port; [`configure_serial_port`] applies
/// the fixed 9600 8N1 / RTS-high configuration a real port needs before one
/// is handed to [`FdcServer::new`].
pub struct FdcServer<P> {
    port: P,
    mode: FdcMode,
    disk: Disk,
    disk_path: PathBuf,
}

/// Apply the session's fixed serial configuration: 9600 baud, 8N1, no flow
/// control, RTS asserted for the session's lifetime.
pub fn configure_serial_port<P: SerialPort>(port: &mut P) -> Result<()> {
    port.configure(&PortSettings {
        baud_rate: serial::BaudRate::Baud9600,
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityNone,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    })?;
    port.set_rts(true)?;
    port.set_timeout(Duration::from_secs(3600))?;

    Ok(())
}

impl<P: Read + Write> FdcServer<P> {
    pub fn new(disk_path: &Path, port: P) -> Result<Self> {
        let mut disk = Disk::new();

        if disk_path.exists() {
            disk.load(disk_path)?;
        }

        Ok(FdcServer {
            port,
            mode: FdcMode::Op,
            disk,
            disk_path: disk_path.to_owned(),
        })
    }

    /// Drive the protocol loop until the port returns an I/O error (e.g.
    /// the session is torn down). The caller is responsible for flushing
    /// the disk to its backing file on any exit path.
    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            self.step()?;
            self.disk.save(&self.disk_path)?;
        }
    }

    fn step(&mut self) -> Result<()> {
        match self.mode {
            FdcMode::Op => self.step_op(),
            FdcMode::Fdc => self.step_fdc(),
        }
    }

    fn step_op(&mut self) -> Result<()> {
        let zz = read_nonzero(&mut self.port, 2)?;
        if zz != [b'Z', b'Z'] {
            bail!("Expected ZZ ({:x?}), got {zz:x?}", [b'Z', b'Z']);
        }

        self.handle_op_mode_request()
    }

    #[tracing::instrument(skip(self))]
    fn handle_op_mode_request(&mut self) -> Result<()> {
        let cmd = read_single(&mut self.port)?;
        let datalen = read_single(&mut self.port)?;
        let mut data = vec![0; datalen as usize];
        self.port.read_exact(&mut data)?;
        let expected_checksum = read_single(&mut self.port)?;

        debug!(
            cmd = format!("{cmd:x}"),
            datalen,
            expected_checksum = format!("{expected_checksum:x}"),
            data = format!("{data:x?}"),
            "OP frame received (checksum not validated)"
        );

        match cmd {
            0x8 => {
                self.mode = FdcMode::Fdc;
                Ok(())
            }
            _ => {
                bail!("Unknown command in OP mode: {cmd:x}");
            }
        }
    }

    fn step_fdc(&mut self) -> Result<()> {
        let cmd = read_single(&mut self.port)?;

        match cmd {
            b'\r' => Ok(()),
            b'Z' => self.fdc_op_mode_request(),
            b'A' => self.fdc_read_id_section(),
            b'S' => self.fdc_search_id_section(),
            b'B' | b'C' => self.fdc_write_id_section(),
            b'W' | b'X' => self.fdc_write_sector(),
            b'R' => self.fdc_read_sector(),
            _ => bail!("Unknown command in FDC mode: {cmd:x}"),
        }
    }

    /// The source never documents an explicit FDC → OP transition; this
    /// mirrors the one real behavior observed: a second `Z` while already
    /// in FDC mode re-enters the OP-mode request handler.
    #[tracing::instrument(skip(self))]
    fn fdc_op_mode_request(&mut self) -> Result<()> {
        let cmd = read_single(&mut self.port)?;
        if cmd == b'Z' {
            self.mode = FdcMode::Op;
            self.handle_op_mode_request()
        } else {
            bail!("Got 'Z' in FDC mode but not followed by another 'Z', got: {cmd:x?}")
        }
    }

    #[tracing::instrument(skip(self))]
    fn fdc_read_id_section(&mut self) -> Result<()> {
        let args = self.read_fdc_args()?;
        let (psn, _) = parse_psn_lsn(&args)?;

        let response = format!("00{psn:02X}0000");
        self.port.write_all(response.as_bytes())?;

        let wait_value = read_single(&mut self.port)?;
        ensure!(wait_value == b'\r', "Expected \\r, got {wait_value:x}");

        let id = *self.disk.sector_id(psn as usize)?;
        self.port.write_all(&id)?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn fdc_search_id_section(&mut self) -> Result<()> {
        let args = self.read_fdc_args()?;
        ensure!(
            args.is_empty(),
            "There should be no args provided to search_id"
        );

        self.port.write_all(b"00000000")?;

        let mut sector_id = [0; crate::disk::SECTOR_ID_LEN];
        self.port.read_exact(&mut sector_id)?;

        debug!("Trying to find sector with ID {sector_id:02x?}");

        if let Some(sector_index) = self.disk.index_of_id(&sector_id) {
            debug!("  Found at index {sector_index}");
            let buffer = format!("00{sector_index:02X}0000");
            self.port.write_all(buffer.as_bytes())?;
        } else {
            debug!("  Not found");
            self.port.write_all(b"40000000")?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn fdc_write_id_section(&mut self) -> Result<()> {
        let args = self.read_fdc_args()?;
        let (psn, _) = parse_psn_lsn(&args)?;

        self.port.write_all(format!("00{psn:02X}0000").as_bytes())?;

        let mut sector_id = [0; crate::disk::SECTOR_ID_LEN];
        self.port.read_exact(&mut sector_id)?;

        debug!("Setting sector ID for index {psn} to {sector_id:02x?}");

        self.disk.set_sector_id(psn as usize, sector_id)?;

        self.port.write_all(format!("00{psn:02X}0000").as_bytes())?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn fdc_write_sector(&mut self) -> Result<()> {
        let args = self.read_fdc_args()?;
        let (psn, _) = parse_psn_lsn(&args)?;

        self.port.write_all(format!("00{psn:02X}0000").as_bytes())?;

        let mut data = [0; crate::disk::SECTOR_DATA_LEN];
        self.port.read_exact(&mut data)?;

        debug!("Data received");
        trace!("  data = {data:02x?}");

        self.disk.set_sector_data(psn as usize, data)?;

        self.port.write_all(format!("00{psn:02X}0000").as_bytes())?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn fdc_read_sector(&mut self) -> Result<()> {
        let args = self.read_fdc_args()?;
        let (psn, _) = parse_psn_lsn(&args)?;

        self.port.write_all(format!("00{psn:02X}0000").as_bytes())?;

        let wait_value = read_single(&mut self.port)?;
        ensure!(wait_value == b'\r', "Expected \\r, got {wait_value:x}");

        let data = *self.disk.sector_data(psn as usize)?;
        self.port.write_all(&data)?;

        Ok(())
    }

    fn read_fdc_args(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut buf = vec![];

        loop {
            let arg = read_single(&mut self.port)?;
            if arg == b'\r' {
                break;
            } else if arg == b' ' {
                continue;
            }

            buf.push(arg);
        }

        let parsed_args = if buf.is_empty() {
            vec![]
        } else {
            buf.split(|b| *b == b',').map(|bs| bs.to_vec()).collect()
        };

        debug!("Raw FDC arguments {buf:02x?}, parsed args {parsed_args:02x?}");

        Ok(parsed_args)
    }
}

fn read_nonzero(port: &mut dyn Read, count: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(count);

    while buf.len() != count {
        let first_nonzero = buf.len();
        buf.resize(count, 0);
        port.read_exact(&mut buf[first_nonzero..])?;

        buf.retain(|b| *b != 0);
    }

    Ok(buf)
}

fn read_single(port: &mut dyn Read) -> Result<u8> {
    let mut buf = [0];
    port.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn parse_psn_lsn(args: &[Vec<u8>]) -> Result<(u8, u8)> {
    let mut psn = 0;
    let mut lsn = 1;

    if let Some(psn_arg_bytes) = args.first() {
        psn = std::str::from_utf8(psn_arg_bytes)?.parse::<u8>()?;
        ensure!(
            (psn as usize) < crate::disk::SECTOR_COUNT,
            "Sector index {psn} out of bounds"
        );
    }
    if let Some(lsn_arg_bytes) = args.get(1) {
        lsn = std::str::from_utf8(lsn_arg_bytes)?.parse::<u8>()?;
    }

    debug!("Parsed PSN={psn}, LSN={lsn}");

    Ok((psn, lsn))
}

#[cfg(test)]
use std::collections::VecDeque;

/// An in-memory duplex the FDC engine can drive without real hardware:
/// reads come from a fixed script, writes are appended to a buffer.
#[cfg(test)]
struct MockPort {
    to_read: VecDeque<u8>,
    written: Vec<u8>,
}

#[cfg(test)]
impl MockPort {
    fn new(script: &[u8]) -> Self {
        MockPort {
            to_read: script.iter().copied().collect(),
            written: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.to_read.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 && !buf.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "mock port exhausted",
            ));
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
fn server_with_script(script: &[u8]) -> FdcServer<MockPort> {
    let port = MockPort::new(script);
    FdcServer {
        port,
        mode: FdcMode::Fdc,
        disk: Disk::new(),
        disk_path: PathBuf::from("/dev/null/unused"),
    }
}

#[test]
fn read_id_section_returns_status_then_id() {
    let mut server = server_with_script(b"A3\r\r");
    server.disk.set_sector_id(3, *b"HELLO_WORLD!").unwrap();

    server.step().unwrap();

    assert_eq!(server.port.written, b"00030000HELLO_WORLD!");
}

#[test]
fn search_id_section_reports_miss() {
    let mut script = b"S".to_vec();
    script.extend(b"????????????");
    let mut server = server_with_script(&script);

    server.step().unwrap();

    assert_eq!(server.port.written, b"0000000040000000");
}

#[test]
fn search_id_section_reports_hit() {
    let mut server_disk = Disk::new();
    server_disk.set_sector_id(5, *b"FOUND_SECTOR").unwrap();

    let mut script = b"S".to_vec();
    script.extend(b"FOUND_SECTOR");
    let port = MockPort::new(&script);
    let mut server = FdcServer {
        port,
        mode: FdcMode::Fdc,
        disk: server_disk,
        disk_path: PathBuf::from("/dev/null/unused"),
    };

    server.step().unwrap();

    let mut expected = b"00000000".to_vec();
    expected.extend(b"00050000");
    assert_eq!(server.port.written, expected);
}

#[test]
fn write_sector_data_round_trips() {
    let payload = vec![0x42u8; crate::disk::SECTOR_DATA_LEN];
    let mut script = b"W7\r".to_vec();
    script.extend(&payload);

    let mut server = server_with_script(&script);
    server.step().unwrap();

    assert_eq!(server.disk.sector_data(7).unwrap(), payload.as_slice());
    assert_eq!(server.port.written, b"0007000000070000");
}

#[test]
fn write_id_section_round_trips() {
    let mut script = b"B2\r".to_vec();
    script.extend(b"ABCDEFGHIJKL");

    let mut server = server_with_script(&script);
    server.step().unwrap();

    assert_eq!(server.disk.sector_id(2).unwrap(), b"ABCDEFGHIJKL");
    assert_eq!(server.port.written, b"0002000000020000");
}

#[test]
fn read_sector_data_returns_full_payload() {
    let payload: Vec<u8> = (0..crate::disk::SECTOR_DATA_LEN)
        .map(|i| (i % 256) as u8)
        .collect();
    let mut payload_arr = [0u8; crate::disk::SECTOR_DATA_LEN];
    payload_arr.copy_from_slice(&payload);

    let mut disk = Disk::new();
    disk.set_sector_data(9, payload_arr).unwrap();

    let mut script = b"R9\r".to_vec();
    script.push(b'\r');

    let port = MockPort::new(&script);
    let mut server = FdcServer {
        port,
        mode: FdcMode::Fdc,
        disk,
        disk_path: PathBuf::from("/dev/null/unused"),
    };

    server.step().unwrap();

    let mut expected = b"00090000".to_vec();
    expected.extend(&payload);
    assert_eq!(server.port.written, expected);
}

#[test]
fn op_mode_switches_to_fdc_on_command_8() {
    let mut script = b"ZZ".to_vec();
    script.push(0x08); // cmd
    script.push(0x00); // datalen
    script.push(0x00); // checksum
    let port = MockPort::new(&script);
    let mut server = FdcServer {
        port,
        mode: FdcMode::Op,
        disk: Disk::new(),
        disk_path: PathBuf::from("/dev/null/unused"),
    };

    server.step().unwrap();

    assert!(matches!(server.mode, FdcMode::Fdc));
}

#[test]
fn unknown_fdc_command_is_fatal() {
    let mut server = server_with_script(b"Q\r");
    assert!(server.step().is_err());
}
