use byteorder::{LittleEndian, WriteBytesExt};

use crate::*;

pub(crate) fn save_indices<F: Write>(
    f: &mut F,
    index_frame: &[TimestampLoc],
    index_keyframes: &BTreeMap<Vec<u8>, Vec<TimestampLoc>>,
) -> UFMFResult<usize> {
    let mut pos = 0;
    pos += start_dict(f, 2)?;

    pos += write_key(f, b"frame")?;
    pos += write_idx(f, index_frame)?;

    pos += write_key(f, b"keyframe")?;
    pos += start_dict(f, cast::u8(index_keyframes.len())?)?;
    for (keyframe_type, keyframe_index) in index_keyframes.iter() {
        pos += write_key(f, keyframe_type)?;
        pos += write_idx(f, keyframe_index)?;
    }

    Ok(pos)
}

fn write_idx<F: Write>(f: &mut F, idx: &[TimestampLoc]) -> UFMFResult<usize> {
    if idx.is_empty() {
        return start_dict(f, 0);
    }
    let mut pos = start_dict(f, 2)?;
    pos += write_key(f, b"loc")?;
    pos += write_array(f, b'l', idx.len(), |f| {
        for x in idx {
            f.write_u64::<LittleEndian>(x.loc)?;
        }
        Ok(())
    })?;
    pos += write_key(f, b"timestamp")?;
    pos += write_array(f, b'd', idx.len(), |f| {
        for x in idx {
            f.write_f64::<LittleEndian>(x.timestamp)?;
        }
        Ok(())
    })?;
    Ok(pos)
}

fn start_dict<F: Write>(f: &mut F, n_keys: u8) -> UFMFResult<usize> {
    f.write_all(&[b'd', n_keys])?;
    Ok(2)
}

fn write_key<F: Write>(f: &mut F, key: &[u8]) -> UFMFResult<usize> {
    let buf = structure!("<H").pack(cast::u16(key.len())?)?;
    f.write_all(&buf)?;
    f.write_all(key)?;
    Ok(buf.len() + key.len())
}

/// Write an array of 8 byte elements. `write_elements` writes the payload.
fn write_array<F, W>(f: &mut F, dtype_char: u8, n_elements: usize, write_elements: W) -> UFMFResult<usize>
where
    F: Write,
    W: FnOnce(&mut F) -> std::io::Result<()>,
{
    let bytes_per_element = 8;
    let n_bytes = n_elements * bytes_per_element;
    f.write_all(&[b'a', dtype_char])?;
    let buf = structure!("<I").pack(cast::u32(n_bytes)?)?;
    f.write_all(&buf)?;
    write_elements(f)?;
    Ok(2 + buf.len() + n_bytes)
}
