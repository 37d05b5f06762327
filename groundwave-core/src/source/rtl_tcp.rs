//! Minimal rtl_tcp client driver: the 12-byte dongle-info handshake
//! plus the command set needed to open and steer a sample stream.
//!
//! Samples arrive as unsigned 8-bit I/Q pairs and are normalized to
//! +/-1.0 full scale.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use num_complex::Complex32;
use tracing::{debug, info};

use crate::config::{ConfigChange, Gain, SourceConfig};
use crate::errors::SourceError;

use super::{RawBlock, ReadOutcome, SourceDriver, READ_TIMEOUT};

const CMD_SET_FREQ: u8 = 0x01;
const CMD_SET_SAMPLE_RATE: u8 = 0x02;
const CMD_SET_GAIN_MODE: u8 = 0x03;
const CMD_SET_GAIN: u8 = 0x04;
const CMD_SET_AGC_MODE: u8 = 0x08;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAGIC: &[u8; 4] = b"RTL0";

fn tuner_name(id: u32) -> &'static str {
    match id {
        1 => "E4000",
        2 => "FC0012",
        3 => "FC0013",
        4 => "FC2580",
        5 => "R820T",
        6 => "R828D",
        _ => "Unknown",
    }
}

pub struct RtlTcpDriver {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    tuner_type: u32,
    tuner_gain_count: u32,
    /// Logical center frequency blocks are tagged with.
    current_center_freq: i64,
}

impl RtlTcpDriver {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
            tuner_type: 0,
            tuner_gain_count: 0,
            current_center_freq: 0,
        }
    }

    fn send_command(&mut self, command: u8, value: u32) -> Result<(), SourceError> {
        let stream = self.stream.as_mut().ok_or(SourceError::Terminated)?;
        // Command byte + big-endian u32 parameter.
        let mut packet = [0u8; 5];
        packet[0] = command;
        packet[1..].copy_from_slice(&value.to_be_bytes());
        stream.write_all(&packet)?;
        debug!(command = format!("{command:#04x}"), value, "sent rtl_tcp command");
        Ok(())
    }

    fn apply_tuning(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        // Down-converter offsets shift the hardware tune; blocks still
        // carry the logical center frequency.
        let hardware_freq = (config.center_freq - config.offset_freq).max(0) as u32;
        self.send_command(CMD_SET_SAMPLE_RATE, config.sample_rate)?;
        self.send_command(CMD_SET_FREQ, hardware_freq)?;
        self.current_center_freq = config.center_freq;
        self.apply_gain(config)
    }

    fn apply_gain(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        match config.gain {
            Gain::Agc => {
                self.send_command(CMD_SET_GAIN_MODE, 0)?;
                self.send_command(CMD_SET_AGC_MODE, 1)
            }
            Gain::Db(db) => {
                self.send_command(CMD_SET_AGC_MODE, 0)?;
                self.send_command(CMD_SET_GAIN_MODE, 1)?;
                // Tuner gain is expressed in tenths of a dB.
                self.send_command(CMD_SET_GAIN, (db * 10.0).round().max(0.0) as u32)
            }
        }
    }
}

impl SourceDriver for RtlTcpDriver {
    fn open(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let address = format!("{}:{}", self.host, self.port);
        let sock_addr = address
            .to_socket_addrs()
            .map_err(|err| SourceError::Unreachable {
                host: self.host.clone(),
                port: self.port,
                reason: err.to_string(),
            })?
            .next()
            .ok_or_else(|| SourceError::Unreachable {
                host: self.host.clone(),
                port: self.port,
                reason: "no addresses resolved".to_string(),
            })?;

        let stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT).map_err(|err| {
            SourceError::Unreachable {
                host: self.host.clone(),
                port: self.port,
                reason: err.to_string(),
            }
        })?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        // Dongle info header: magic, tuner type, tuner gain count, all
        // network byte order.
        let mut header = [0u8; 12];
        {
            let stream = self.stream.as_mut().ok_or(SourceError::Terminated)?;
            let mut filled = 0;
            while filled < header.len() {
                match stream.read(&mut header[filled..]) {
                    Ok(0) => {
                        return Err(SourceError::BadHandshake {
                            host: self.host.clone(),
                        })
                    }
                    Ok(n) => filled += n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if &header[..4] != MAGIC {
            return Err(SourceError::BadHandshake {
                host: self.host.clone(),
            });
        }
        self.tuner_type = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        self.tuner_gain_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        info!(
            host = %self.host,
            tuner = tuner_name(self.tuner_type),
            gain_count = self.tuner_gain_count,
            "connected to rtl_tcp server"
        );

        self.apply_tuning(config)
    }

    fn read_block(&mut self, num_samples: usize) -> Result<ReadOutcome, SourceError> {
        let center_freq = self.current_center_freq;
        let stream = self.stream.as_mut().ok_or(SourceError::Terminated)?;

        let mut data = vec![0u8; num_samples * 2];
        let mut filled = 0;
        loop {
            match stream.read(&mut data[filled..]) {
                Ok(0) => return Err(SourceError::Terminated),
                Ok(n) => {
                    filled += n;
                    if filled == data.len() {
                        break;
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if filled == 0 {
                        return Ok(ReadOutcome::Timeout);
                    }
                    // Partial block: keep reading; stop signals are
                    // observed at block granularity.
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let samples: Vec<Complex32> = data
            .chunks_exact(2)
            .map(|pair| {
                Complex32::new(
                    (pair[0] as f32 - 127.5) / 127.5,
                    (pair[1] as f32 - 127.5) / 127.5,
                )
            })
            .collect();
        Ok(ReadOutcome::Block(RawBlock {
            samples,
            center_freq,
            wall_clock: None,
            playback: None,
        }))
    }

    fn reconfigure(
        &mut self,
        config: &SourceConfig,
        change: ConfigChange,
    ) -> Result<(), SourceError> {
        match change {
            ConfigChange::RequiresFlush => {
                // rtl_tcp has no explicit flush; retune, then discard
                // one socket buffer's worth of stale samples so the
                // next block carries only post-change data.
                self.apply_tuning(config)?;
                let stream = self.stream.as_mut().ok_or(SourceError::Terminated)?;
                let mut scratch = vec![0u8; 65536];
                match stream.read(&mut scratch) {
                    Ok(_) => {}
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(())
            }
            ConfigChange::InFlight => self.apply_gain(config),
            ConfigChange::None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.stream = None;
        info!(host = %self.host, "rtl_tcp connection closed");
    }
}
