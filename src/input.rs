// Input side of the pipeline: a sum type over the supported containers.
// Every reader hands the core normalized ±1.0 interleaved samples; DSD
// readers (DSF, DFF) expand 1-bit data to ±1.0 floats at the native DSD rate.

use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use id3::TagLike;
use log::{debug, warn};

use crate::format::SubFormat;
use crate::real::Real;

/// Tag fields copied from input to output when the containers support them.
#[derive(Debug, Default, Clone)]
pub struct MetaData {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub date: String,
    pub genre: String,
    pub comment: String,
    pub track_number: String,
    pub copyright: String,
    pub software: String,
}

impl MetaData {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.artist.is_empty()
            && self.album.is_empty()
            && self.date.is_empty()
            && self.genre.is_empty()
            && self.comment.is_empty()
            && self.track_number.is_empty()
            && self.copyright.is_empty()
            && self.software.is_empty()
    }
}

pub enum InputFile {
    Wav(WavReader),
    Aiff(AiffReader),
    Dsf(DsfReader),
    Dff(DffReader),
}

impl InputFile {
    pub fn open(path: &Path) -> Result<Self, Box<dyn Error>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "wave" | "rf64" => Ok(Self::Wav(WavReader::open(path)?)),
            "aif" | "aiff" => Ok(Self::Aiff(AiffReader::open(path)?)),
            "dsf" => Ok(Self::Dsf(DsfReader::open(path)?)),
            "dff" => Ok(Self::Dff(DffReader::open(path)?)),
            other => Err(format!("Unsupported input file extension: {}", other).into()),
        }
    }

    pub fn channels(&self) -> u32 {
        match self {
            Self::Wav(r) => r.channels,
            Self::Aiff(r) => r.channels,
            Self::Dsf(r) => r.channels,
            Self::Dff(r) => r.channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Wav(r) => r.sample_rate,
            Self::Aiff(r) => r.sample_rate,
            Self::Dsf(r) => r.sample_rate,
            Self::Dff(r) => r.sample_rate,
        }
    }

    /// Frames (samples per channel) in the file.
    pub fn frames(&self) -> u64 {
        match self {
            Self::Wav(r) => r.frames,
            Self::Aiff(r) => r.frames,
            Self::Dsf(r) => r.frames,
            Self::Dff(r) => r.frames,
        }
    }

    /// PCM subformat of the source, None for 1-bit DSD.
    pub fn subformat(&self) -> Option<SubFormat> {
        match self {
            Self::Wav(r) => Some(r.subformat),
            Self::Aiff(r) => Some(r.subformat),
            Self::Dsf(_) | Self::Dff(_) => None,
        }
    }

    pub fn is_dsd(&self) -> bool {
        matches!(self, Self::Dsf(_) | Self::Dff(_))
    }

    pub fn metadata(&self) -> &MetaData {
        match self {
            Self::Wav(r) => &r.metadata,
            Self::Aiff(r) => &r.metadata,
            Self::Dsf(r) => &r.metadata,
            Self::Dff(r) => &r.metadata,
        }
    }

    /// Fill `buf` with interleaved normalized samples; returns the sample
    /// count actually read (a multiple of the channel count except at EOF).
    pub fn read<F: Real>(&mut self, buf: &mut [F]) -> io::Result<usize> {
        match self {
            Self::Wav(r) => r.read(buf),
            Self::Aiff(r) => r.read(buf),
            Self::Dsf(r) => r.read(buf),
            Self::Dff(r) => r.read(buf),
        }
    }

    /// Rewind to the first audio frame.
    pub fn seek_start(&mut self) -> io::Result<()> {
        match self {
            Self::Wav(r) => r.seek_start(),
            Self::Aiff(r) => r.seek_start(),
            Self::Dsf(r) => r.seek_start(),
            Self::Dff(r) => r.seek_start(),
        }
    }
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_u16le(r: &mut impl Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32le(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64le(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_u16be(r: &mut impl Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32be(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64be(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

/// Decode an 80-bit IEEE 754 extended float (AIFF sample rates).
pub(crate) fn decode_extended(b: &[u8; 10]) -> f64 {
    let exponent = ((i32::from(b[0] & 0x7f)) << 8 | i32::from(b[1])) - 16383;
    let mut mant = [0u8; 8];
    mant.copy_from_slice(&b[2..10]);
    let mantissa = u64::from_be_bytes(mant);
    if mantissa == 0 {
        return 0.0;
    }
    let sign = if b[0] & 0x80 != 0 { -1.0 } else { 1.0 };
    sign * mantissa as f64 * 2f64.powi(exponent - 63)
}

// ------------------------------------------------------------------------
// WAV / RF64

pub struct WavReader {
    file: BufReader<File>,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
    pub subformat: SubFormat,
    pub metadata: MetaData,
    data_pos: u64,
    data_len: u64,
    bytes_left: u64,
    scratch: Vec<u8>,
}

impl WavReader {
    pub fn open(path: &Path) -> Result<Self, Box<dyn Error>> {
        let mut file = BufReader::new(File::open(path)?);

        let mut id = [0u8; 4];
        file.read_exact(&mut id)?;
        if &id != b"RIFF" && &id != b"RF64" {
            return Err("Not a RIFF/RF64 file".into());
        }
        let _riff_size = read_u32le(&mut file)?;
        file.read_exact(&mut id)?;
        if &id != b"WAVE" {
            return Err("RIFF file is not WAVE".into());
        }

        let mut ds64_data_size: Option<u64> = None;
        let mut fmt: Option<(u16, u16, u32, u16)> = None; // tag, channels, rate, bits
        let mut data: Option<(u64, u64)> = None; // pos, len
        let mut metadata = MetaData::default();

        loop {
            if file.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u32le(&mut file)? as u64;
            match &id {
                b"ds64" => {
                    let _riff64 = read_u64le(&mut file)?;
                    let data64 = read_u64le(&mut file)?;
                    let _samples64 = read_u64le(&mut file)?;
                    ds64_data_size = Some(data64);
                    let skip = size.saturating_sub(24);
                    file.seek(SeekFrom::Current((skip + (size & 1)) as i64))?;
                }
                b"fmt " => {
                    let tag = read_u16le(&mut file)?;
                    let channels = read_u16le(&mut file)?;
                    let rate = read_u32le(&mut file)?;
                    let _byte_rate = read_u32le(&mut file)?;
                    let _block_align = read_u16le(&mut file)?;
                    let bits = read_u16le(&mut file)?;
                    let mut real_tag = tag;
                    if tag == 0xFFFE && size >= 40 {
                        // WAVE_FORMAT_EXTENSIBLE: the actual tag leads the GUID
                        let _ext_size = read_u16le(&mut file)?;
                        let _valid_bits = read_u16le(&mut file)?;
                        let _mask = read_u32le(&mut file)?;
                        real_tag = read_u16le(&mut file)?;
                        let skip = size - 26;
                        file.seek(SeekFrom::Current((skip + (size & 1)) as i64))?;
                    } else {
                        let skip = size.saturating_sub(16);
                        file.seek(SeekFrom::Current((skip + (size & 1)) as i64))?;
                    }
                    fmt = Some((real_tag, channels, rate, bits));
                }
                b"data" => {
                    let pos = file.stream_position()?;
                    let len = if size == u64::from(u32::MAX) {
                        ds64_data_size.ok_or("RF64 data chunk without ds64 size")?
                    } else {
                        size
                    };
                    data = Some((pos, len));
                    file.seek(SeekFrom::Current((len + (len & 1)) as i64))?;
                }
                b"LIST" => {
                    let mut kind = [0u8; 4];
                    file.read_exact(&mut kind)?;
                    let mut remaining = size.saturating_sub(4);
                    if &kind == b"INFO" {
                        Self::parse_info_list(&mut file, &mut remaining, &mut metadata)?;
                    }
                    file.seek(SeekFrom::Current((remaining + (size & 1)) as i64))?;
                }
                _ => {
                    file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
            }
        }

        let (tag, channels, rate, bits) = fmt.ok_or("WAV file has no fmt chunk")?;
        let (data_pos, data_len) = data.ok_or("WAV file has no data chunk")?;
        let subformat = match (tag, bits) {
            (1, 8) => SubFormat::U8,
            (1, 16) => SubFormat::Pcm16,
            (1, 24) => SubFormat::Pcm24,
            (1, 32) => SubFormat::Pcm32,
            (3, 32) => SubFormat::Float,
            (3, 64) => SubFormat::Double,
            (t, b) => return Err(format!("Unsupported WAV format tag {} / {} bits", t, b).into()),
        };
        if channels == 0 {
            return Err("WAV file reports zero channels".into());
        }
        let bytes_per_frame = u64::from(subformat.bytes_per_sample()) * u64::from(channels);
        let frames = data_len / bytes_per_frame;

        file.seek(SeekFrom::Start(data_pos))?;
        Ok(Self {
            file,
            channels: u32::from(channels),
            sample_rate: rate,
            frames,
            subformat,
            metadata,
            data_pos,
            data_len,
            bytes_left: data_len,
            scratch: Vec::new(),
        })
    }

    fn parse_info_list(
        file: &mut BufReader<File>,
        remaining: &mut u64,
        metadata: &mut MetaData,
    ) -> io::Result<()> {
        while *remaining >= 8 {
            let mut id = [0u8; 4];
            file.read_exact(&mut id)?;
            let size = read_u32le(file)? as u64;
            *remaining -= 8;
            let take = size.min(*remaining);
            let mut text = vec![0u8; take as usize];
            file.read_exact(&mut text)?;
            *remaining -= take;
            if size & 1 == 1 && *remaining > 0 {
                file.seek(SeekFrom::Current(1))?;
                *remaining -= 1;
            }
            let value = String::from_utf8_lossy(&text)
                .trim_end_matches('\0')
                .to_string();
            match &id {
                b"INAM" => metadata.title = value,
                b"IART" => metadata.artist = value,
                b"IPRD" => metadata.album = value,
                b"ICRD" => metadata.date = value,
                b"IGNR" => metadata.genre = value,
                b"ICMT" => metadata.comment = value,
                b"ITRK" => metadata.track_number = value,
                b"ICOP" => metadata.copyright = value,
                b"ISFT" => metadata.software = value,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn read<F: Real>(&mut self, buf: &mut [F]) -> io::Result<usize> {
        let bps = self.subformat.bytes_per_sample() as usize;
        let want_bytes = (buf.len() * bps).min(self.bytes_left as usize);
        let want_bytes = want_bytes - want_bytes % bps;
        if want_bytes == 0 {
            return Ok(0);
        }
        self.scratch.resize(want_bytes, 0);
        let got = read_exact_or_eof(&mut self.file, &mut self.scratch)?;
        let got = got - got % bps;
        self.bytes_left -= got as u64;

        let n = got / bps;
        for (i, out) in buf.iter_mut().take(n).enumerate() {
            let b = &self.scratch[i * bps..];
            let v = match self.subformat {
                SubFormat::U8 => (f64::from(b[0]) - 128.0) / 128.0,
                SubFormat::S8 => f64::from(b[0] as i8) / 128.0,
                SubFormat::Pcm16 => f64::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0,
                SubFormat::Pcm24 => {
                    let raw =
                        (i32::from(b[2] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[0]);
                    f64::from(raw) / 8_388_608.0
                }
                SubFormat::Pcm32 => {
                    f64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])) / 2_147_483_648.0
                }
                SubFormat::Float => f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                SubFormat::Double => {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                }
                SubFormat::Vorbis => return Err(bad_data("vorbis is not a PCM subformat")),
            };
            *out = F::from_f64(v);
        }
        Ok(n)
    }

    pub fn seek_start(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.data_pos))?;
        self.bytes_left = self.data_len;
        Ok(())
    }
}

// ------------------------------------------------------------------------
// AIFF

pub struct AiffReader {
    file: BufReader<File>,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
    pub subformat: SubFormat,
    pub metadata: MetaData,
    data_pos: u64,
    data_len: u64,
    bytes_left: u64,
    scratch: Vec<u8>,
}

impl AiffReader {
    pub fn open(path: &Path) -> Result<Self, Box<dyn Error>> {
        let mut file = BufReader::new(File::open(path)?);

        let mut id = [0u8; 4];
        file.read_exact(&mut id)?;
        if &id != b"FORM" {
            return Err("Not an AIFF file".into());
        }
        let _form_size = read_u32be(&mut file)?;
        file.read_exact(&mut id)?;
        if &id != b"AIFF" {
            return Err("Only uncompressed AIFF is supported".into());
        }

        let mut comm: Option<(u16, u64, u16, f64)> = None;
        let mut data: Option<(u64, u64)> = None;

        loop {
            if file.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u32be(&mut file)? as u64;
            match &id {
                b"COMM" => {
                    let channels = read_u16be(&mut file)?;
                    let frames = u64::from(read_u32be(&mut file)?);
                    let bits = read_u16be(&mut file)?;
                    let mut ext = [0u8; 10];
                    file.read_exact(&mut ext)?;
                    let rate = decode_extended(&ext);
                    comm = Some((channels, frames, bits, rate));
                    let skip = size.saturating_sub(18);
                    file.seek(SeekFrom::Current((skip + (size & 1)) as i64))?;
                }
                b"SSND" => {
                    let offset = u64::from(read_u32be(&mut file)?);
                    let _block = read_u32be(&mut file)?;
                    let pos = file.stream_position()? + offset;
                    let len = size.saturating_sub(8 + offset);
                    data = Some((pos, len));
                    let skip = size.saturating_sub(8);
                    file.seek(SeekFrom::Current((skip + (size & 1)) as i64))?;
                }
                _ => {
                    file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
            }
        }

        let (channels, frames, bits, rate) = comm.ok_or("AIFF file has no COMM chunk")?;
        let (data_pos, data_len) = data.ok_or("AIFF file has no SSND chunk")?;
        if channels == 0 || rate <= 0.0 {
            return Err("AIFF COMM chunk is malformed".into());
        }
        let subformat = match bits {
            8 => SubFormat::S8,
            16 => SubFormat::Pcm16,
            24 => SubFormat::Pcm24,
            32 => SubFormat::Pcm32,
            b => return Err(format!("Unsupported AIFF bit depth {}", b).into()),
        };

        file.seek(SeekFrom::Start(data_pos))?;
        Ok(Self {
            file,
            channels: u32::from(channels),
            sample_rate: rate.round() as u32,
            frames,
            subformat,
            metadata: MetaData::default(),
            data_pos,
            data_len,
            bytes_left: data_len,
            scratch: Vec::new(),
        })
    }

    pub fn read<F: Real>(&mut self, buf: &mut [F]) -> io::Result<usize> {
        let bps = self.subformat.bytes_per_sample() as usize;
        let want_bytes = (buf.len() * bps).min(self.bytes_left as usize);
        let want_bytes = want_bytes - want_bytes % bps;
        if want_bytes == 0 {
            return Ok(0);
        }
        self.scratch.resize(want_bytes, 0);
        let got = read_exact_or_eof(&mut self.file, &mut self.scratch)?;
        let got = got - got % bps;
        self.bytes_left -= got as u64;

        let n = got / bps;
        for (i, out) in buf.iter_mut().take(n).enumerate() {
            let b = &self.scratch[i * bps..];
            let v = match self.subformat {
                SubFormat::S8 => f64::from(b[0] as i8) / 128.0,
                SubFormat::Pcm16 => f64::from(i16::from_be_bytes([b[0], b[1]])) / 32768.0,
                SubFormat::Pcm24 => {
                    let raw =
                        (i32::from(b[0] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[2]);
                    f64::from(raw) / 8_388_608.0
                }
                SubFormat::Pcm32 => {
                    f64::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]])) / 2_147_483_648.0
                }
                _ => return Err(bad_data("unexpected AIFF subformat")),
            };
            *out = F::from_f64(v);
        }
        Ok(n)
    }

    pub fn seek_start(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.data_pos))?;
        self.bytes_left = self.data_len;
        Ok(())
    }
}

// ------------------------------------------------------------------------
// DSF

pub struct DsfReader {
    file: BufReader<File>,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
    pub metadata: MetaData,
    audio_pos: u64,
    audio_len: u64,
    block_size: usize,
    /// De-interleaved bit-expanded frames for the current block group.
    group: Vec<f64>,
    group_frames: usize,
    group_cursor: usize,
    frames_left: u64,
    bytes_left: u64,
}

impl DsfReader {
    pub fn open(path: &Path) -> Result<Self, Box<dyn Error>> {
        let mut file = BufReader::new(File::open(path)?);
        let file_size = file.get_ref().metadata()?.len();

        let mut id = [0u8; 4];
        file.read_exact(&mut id)?;
        if &id != b"DSD " {
            return Err("Not a DSF file (missing 'DSD ' chunk)".into());
        }
        let _dsd_size = read_u64le(&mut file)?;
        let _file_size_field = read_u64le(&mut file)?;
        let metadata_ptr = read_u64le(&mut file)?;

        file.read_exact(&mut id)?;
        if &id != b"fmt " {
            return Err("DSF missing 'fmt ' chunk".into());
        }
        let fmt_size = read_u64le(&mut file)?;
        let _fmt_version = read_u32le(&mut file)?;
        let _fmt_id = read_u32le(&mut file)?;
        let _chan_type = read_u32le(&mut file)?;
        let channels = read_u32le(&mut file)?;
        let sampling_freq = read_u32le(&mut file)?;
        let bits_per_sample = read_u32le(&mut file)?;
        let sample_count = read_u64le(&mut file)?;
        let block_size = read_u32le(&mut file)?;
        let _reserved = read_u32le(&mut file)?;
        let to_skip = fmt_size as i64 - 12 - 40;
        if to_skip > 0 {
            file.seek(SeekFrom::Current(to_skip))?;
        }
        if bits_per_sample != 1 {
            return Err("DSF is not 1-bit data".into());
        }
        if channels == 0 || block_size == 0 {
            return Err("DSF fmt chunk is malformed".into());
        }

        file.read_exact(&mut id)?;
        if &id != b"data" {
            return Err("DSF missing 'data' chunk".into());
        }
        let data_size = read_u64le(&mut file)?;
        let audio_pos = file.stream_position()?;
        // data chunk header is 12 bytes; take the minimum of the two length
        // sources to be robust against writer quirks
        let from_chunk = data_size.saturating_sub(12);
        let from_file = file_size.saturating_sub(audio_pos);
        let audio_len = from_chunk.min(from_file);

        let mut metadata = MetaData::default();
        if metadata_ptr > 0 && metadata_ptr < file_size {
            let mut tag_reader = File::open(path)?;
            tag_reader.seek(SeekFrom::Start(metadata_ptr))?;
            match id3::Tag::read_from2(&mut tag_reader) {
                Ok(tag) => {
                    metadata.title = tag.title().unwrap_or_default().to_string();
                    metadata.artist = tag.artist().unwrap_or_default().to_string();
                    metadata.album = tag.album().unwrap_or_default().to_string();
                    if let Some(year) = tag.year() {
                        metadata.date = year.to_string();
                    }
                    metadata.genre = tag.genre().map(|g| g.to_string()).unwrap_or_default();
                    if let Some(track) = tag.track() {
                        metadata.track_number = track.to_string();
                    }
                }
                Err(e) => debug!("DSF ID3 tag unreadable: {}", e),
            }
        }

        file.seek(SeekFrom::Start(audio_pos))?;
        Ok(Self {
            file,
            channels,
            sample_rate: sampling_freq,
            frames: sample_count,
            metadata,
            audio_pos,
            audio_len,
            block_size: block_size as usize,
            group: Vec::new(),
            group_frames: 0,
            group_cursor: 0,
            frames_left: sample_count,
            bytes_left: audio_len,
        })
    }

    /// Pull in the next block group (one block per channel) and expand bits.
    fn refill(&mut self) -> io::Result<()> {
        let channels = self.channels as usize;
        let group_bytes = (self.block_size * channels).min(self.bytes_left as usize);
        if group_bytes < channels {
            self.group_frames = 0;
            self.group_cursor = 0;
            return Ok(());
        }
        let mut raw = vec![0u8; group_bytes];
        let got = read_exact_or_eof(&mut self.file, &mut raw)?;
        self.bytes_left -= got as u64;
        let per_chan = got / channels;
        let frames = per_chan * 8;
        self.group.resize(frames * channels, 0.0);
        for ch in 0..channels {
            let block = &raw[ch * per_chan..(ch + 1) * per_chan];
            for (byte_idx, &byte) in block.iter().enumerate() {
                for bit in 0..8 {
                    // DSF is LSB-first within each byte
                    let sample = if (byte >> bit) & 1 == 1 { 1.0 } else { -1.0 };
                    let frame = byte_idx * 8 + bit;
                    self.group[frame * channels + ch] = sample;
                }
            }
        }
        self.group_frames = frames;
        self.group_cursor = 0;
        Ok(())
    }

    pub fn read<F: Real>(&mut self, buf: &mut [F]) -> io::Result<usize> {
        let channels = self.channels as usize;
        let mut written = 0;
        while written + channels <= buf.len() && self.frames_left > 0 {
            if self.group_cursor >= self.group_frames {
                self.refill()?;
                if self.group_frames == 0 {
                    break;
                }
            }
            let avail_frames = (self.group_frames - self.group_cursor)
                .min((buf.len() - written) / channels)
                .min(self.frames_left as usize);
            let start = self.group_cursor * channels;
            for (out, &v) in buf[written..written + avail_frames * channels]
                .iter_mut()
                .zip(self.group[start..start + avail_frames * channels].iter())
            {
                *out = F::from_f64(v);
            }
            self.group_cursor += avail_frames;
            self.frames_left -= avail_frames as u64;
            written += avail_frames * channels;
        }
        Ok(written)
    }

    pub fn seek_start(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.audio_pos))?;
        self.bytes_left = self.audio_len;
        self.frames_left = self.frames;
        self.group_frames = 0;
        self.group_cursor = 0;
        Ok(())
    }
}

// ------------------------------------------------------------------------
// DFF (DSDIFF)

pub struct DffReader {
    file: BufReader<File>,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
    pub metadata: MetaData,
    audio_pos: u64,
    audio_len: u64,
    bytes_left: u64,
    scratch: Vec<u8>,
}

impl DffReader {
    pub fn open(path: &Path) -> Result<Self, Box<dyn Error>> {
        let mut file = BufReader::new(File::open(path)?);

        let mut id = [0u8; 4];
        file.read_exact(&mut id)?;
        if &id != b"FRM8" {
            return Err("Not a DSDIFF file (missing FRM8)".into());
        }
        let _form_size = read_u64be(&mut file)?;
        file.read_exact(&mut id)?;
        if &id != b"DSD " {
            return Err("FRM8 form is not DSD".into());
        }

        let mut sample_rate = 0u32;
        let mut channels = 0u32;
        let mut data: Option<(u64, u64)> = None;

        loop {
            if file.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u64be(&mut file)?;
            match &id {
                b"PROP" => {
                    let mut kind = [0u8; 4];
                    file.read_exact(&mut kind)?;
                    if &kind != b"SND " {
                        file.seek(SeekFrom::Current((size.saturating_sub(4) + (size & 1)) as i64))?;
                        continue;
                    }
                    let mut remaining = size - 4;
                    while remaining >= 12 {
                        let mut sub = [0u8; 4];
                        file.read_exact(&mut sub)?;
                        let sub_size = read_u64be(&mut file)?;
                        remaining -= 12;
                        let consume = sub_size.min(remaining);
                        match &sub {
                            b"FS  " if consume >= 4 => {
                                sample_rate = read_u32be(&mut file)?;
                                file.seek(SeekFrom::Current((consume - 4) as i64))?;
                            }
                            b"CHNL" if consume >= 2 => {
                                channels = u32::from(read_u16be(&mut file)?);
                                file.seek(SeekFrom::Current((consume - 2) as i64))?;
                            }
                            _ => {
                                file.seek(SeekFrom::Current(consume as i64))?;
                            }
                        }
                        remaining -= consume;
                        if sub_size & 1 == 1 && remaining > 0 {
                            file.seek(SeekFrom::Current(1))?;
                            remaining -= 1;
                        }
                    }
                    if remaining > 0 {
                        file.seek(SeekFrom::Current(remaining as i64))?;
                    }
                    if size & 1 == 1 {
                        file.seek(SeekFrom::Current(1))?;
                    }
                }
                b"DSD " => {
                    let pos = file.stream_position()?;
                    data = Some((pos, size));
                    file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
                _ => {
                    file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
            }
        }

        let (audio_pos, audio_len) = data.ok_or("DSDIFF has no DSD data chunk")?;
        if channels == 0 || sample_rate == 0 {
            return Err("DSDIFF PROP chunk incomplete (channels / FS)".into());
        }
        if audio_len % u64::from(channels) != 0 {
            warn!("DSDIFF data size is not a whole number of channel frames");
        }

        file.seek(SeekFrom::Start(audio_pos))?;
        let frames = audio_len / u64::from(channels) * 8;
        Ok(Self {
            file,
            channels,
            sample_rate,
            frames,
            metadata: MetaData::default(),
            audio_pos,
            audio_len,
            bytes_left: audio_len,
            scratch: Vec::new(),
        })
    }

    pub fn read<F: Real>(&mut self, buf: &mut [F]) -> io::Result<usize> {
        let channels = self.channels as usize;
        // one interleaved byte row yields 8 interleaved frames
        let rows = (buf.len() / (8 * channels)).min(self.bytes_left as usize / channels);
        if rows == 0 {
            return Ok(0);
        }
        self.scratch.resize(rows * channels, 0);
        let got = read_exact_or_eof(&mut self.file, &mut self.scratch)?;
        let got_rows = got / channels;
        self.bytes_left -= (got_rows * channels) as u64;

        for row in 0..got_rows {
            for ch in 0..channels {
                let byte = self.scratch[row * channels + ch];
                for bit in 0..8 {
                    // DSDIFF is MSB-first within each byte
                    let sample = if (byte >> (7 - bit)) & 1 == 1 { 1.0 } else { -1.0 };
                    let frame = row * 8 + bit;
                    buf[frame * channels + ch] = F::from_f64(sample);
                }
            }
        }
        Ok(got_rows * 8 * channels)
    }

    pub fn seek_start(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.audio_pos))?;
        self.bytes_left = self.audio_len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("rerate-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn extended_float_decodes_common_rates() {
        // 44100 = 0x400E AC44...
        let b: [u8; 10] = [0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_extended(&b).round() as u32, 44100);
        // 48000 = 0x400E BB80...
        let b: [u8; 10] = [0x40, 0x0E, 0xBB, 0x80, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_extended(&b).round() as u32, 48000);
        let zero = [0u8; 10];
        assert_eq!(decode_extended(&zero), 0.0);
    }

    #[test]
    fn dsf_reader_parses_header_and_expands_bits() {
        let path = temp_path("in.dsf");
        let channels = 2u32;
        let block = 16u32; // tiny block size for the test
        let frames = u64::from(block * 8);
        let mut f = File::create(&path).unwrap();
        // DSD chunk
        f.write_all(b"DSD ").unwrap();
        f.write_all(&28u64.to_le_bytes()).unwrap();
        f.write_all(&0u64.to_le_bytes()).unwrap(); // file size (unused)
        f.write_all(&0u64.to_le_bytes()).unwrap(); // no metadata
        // fmt chunk
        f.write_all(b"fmt ").unwrap();
        f.write_all(&52u64.to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap(); // version
        f.write_all(&0u32.to_le_bytes()).unwrap(); // format id
        f.write_all(&2u32.to_le_bytes()).unwrap(); // channel type
        f.write_all(&channels.to_le_bytes()).unwrap();
        f.write_all(&2_822_400u32.to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap(); // bits per sample
        f.write_all(&frames.to_le_bytes()).unwrap();
        f.write_all(&block.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap(); // reserved
        // data chunk: ch0 all ones (+1.0), ch1 all zeros (-1.0)
        let payload = block as usize * channels as usize;
        f.write_all(b"data").unwrap();
        f.write_all(&((payload + 12) as u64).to_le_bytes()).unwrap();
        f.write_all(&vec![0xFFu8; block as usize]).unwrap();
        f.write_all(&vec![0x00u8; block as usize]).unwrap();
        drop(f);

        let mut r = DsfReader::open(&path).unwrap();
        assert_eq!(r.channels, 2);
        assert_eq!(r.sample_rate, 2_822_400);
        assert_eq!(r.frames, frames);
        let mut buf = vec![0f64; (frames * 2) as usize];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        for frame in buf.chunks(2) {
            assert_eq!(frame[0], 1.0);
            assert_eq!(frame[1], -1.0);
        }
        // rewind and read again
        r.seek_start().unwrap();
        let n = r.read(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dff_reader_parses_header_and_bit_order() {
        let path = temp_path("in.dff");
        let mut f = File::create(&path).unwrap();
        // data: one byte per channel, 0b10000000 -> first frame +1, rest -1
        let data: [u8; 2] = [0b1000_0000, 0b0000_0000];
        let prop_body_len = 4 + (12 + 4) + (12 + 2); // "SND " + FS + CHNL
        f.write_all(b"FRM8").unwrap();
        f.write_all(&0u64.to_be_bytes()).unwrap(); // form size (unused)
        f.write_all(b"DSD ").unwrap();
        f.write_all(b"PROP").unwrap();
        f.write_all(&(prop_body_len as u64).to_be_bytes()).unwrap();
        f.write_all(b"SND ").unwrap();
        f.write_all(b"FS  ").unwrap();
        f.write_all(&4u64.to_be_bytes()).unwrap();
        f.write_all(&2_822_400u32.to_be_bytes()).unwrap();
        f.write_all(b"CHNL").unwrap();
        f.write_all(&2u64.to_be_bytes()).unwrap();
        f.write_all(&2u16.to_be_bytes()).unwrap();
        f.write_all(b"DSD ").unwrap();
        f.write_all(&(data.len() as u64).to_be_bytes()).unwrap();
        f.write_all(&data).unwrap();
        drop(f);

        let mut r = DffReader::open(&path).unwrap();
        assert_eq!(r.channels, 2);
        assert_eq!(r.sample_rate, 2_822_400);
        assert_eq!(r.frames, 8);
        let mut buf = vec![0f64; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(n, 16);
        // MSB of channel 0 is set: frame 0 ch 0 is +1
        assert_eq!(buf[0], 1.0);
        assert_eq!(buf[1], -1.0);
        // every later frame is -1 on both channels
        for &v in &buf[2..] {
            assert_eq!(v, -1.0);
        }
        std::fs::remove_file(&path).ok();
    }
}
