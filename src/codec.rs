//! Byte-level helpers shared by the persisted record formats.

use std::io::{Read, Write};

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};

use crate::Result;

/// Bitcoin CompactSize: one tag byte, then 0, 2, 4 or 8 little-endian bytes.
pub(crate) fn write_varint<W: Write>(w: &mut W, n: u64) -> Result<()> {
    match n {
        0..=0xfc => w.write_all(&[n as u8])?,
        0xfd..=0xffff => {
            w.write_all(&[0xfd])?;
            w.write_all(&(n as u16).to_le_bytes())?;
        }
        0x1_0000..=0xffff_ffff => {
            w.write_all(&[0xfe])?;
            w.write_all(&(n as u32).to_le_bytes())?;
        }
        _ => {
            w.write_all(&[0xff])?;
            w.write_all(&n.to_le_bytes())?;
        }
    }
    Ok(())
}

pub(crate) fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0xfd => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            u16::from_le_bytes(b) as u64
        }
        0xfe => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            u32::from_le_bytes(b) as u64
        }
        0xff => {
            let mut b = [0u8; 8];
            r.read_exact(&mut b)?;
            u64::from_le_bytes(b)
        }
        n => n as u64,
    })
}

/// Txid bytes followed by the output index, big-endian.
pub(crate) fn write_outpoint<W: Write>(w: &mut W, outpoint: &OutPoint) -> Result<()> {
    w.write_all(&outpoint.txid.to_byte_array())?;
    w.write_all(&outpoint.vout.to_be_bytes())?;
    Ok(())
}

pub(crate) fn read_outpoint<R: Read>(r: &mut R) -> Result<OutPoint> {
    let mut txid = [0u8; 32];
    r.read_exact(&mut txid)?;
    let mut vout = [0u8; 4];
    r.read_exact(&mut vout)?;
    Ok(OutPoint {
        txid: Txid::from_byte_array(txid),
        vout: u32::from_be_bytes(vout),
    })
}

pub(crate) fn write_var_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_varint(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

pub(crate) fn read_var_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_varint(r)?;
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}
