// Group Code Recording, the 6-and-2 scheme of the 400K/800K Sony drives.
// Tracks are laid out in five 16-track zones with 12 down to 8 sectors and a
// matching spindle speed per zone. A sector is 731 GCR bytes: sync, the
// D5 AA 96 address block, sync, the D5 AA AD data block carrying the 12-byte
// tag and 512 data bytes nibblized three-at-a-time through the rotating
// ca/cb/cc checksum, a checksum group, and trailers. A track adds a 548-byte
// speed gap, which puts the 12-sector track at exactly 9320 bytes.

pub const TRACKS_PER_SIDE: usize = 80;
pub const SECTOR_SIZE: usize = 512;
pub const TAG_SIZE: usize = 12;
const ENCODED_LEN: usize = TAG_SIZE + SECTOR_SIZE; // 524
pub const SECTOR_GCR_BYTES: usize = 731;
pub const TRACK_GAP: usize = 548;

// Spindle speed per 16-track zone, in RPM; sectors x RPM is constant.
pub const ZONE_RPM: [u64; 5] = [394, 429, 472, 525, 590];

// The 64 valid GCR codewords for the 6-bit groups.
pub const GCR_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

fn gcr_decode(byte: u8) -> Option<u8> {
    GCR_TABLE.iter().position(|&c| c == byte).map(|i| i as u8)
}

pub fn zone(track: usize) -> usize {
    track / 16
}

pub fn sectors_in_track(track: usize) -> usize {
    12 - zone(track)
}

pub fn track_gcr_len(track: usize) -> usize {
    sectors_in_track(track) * SECTOR_GCR_BYTES + TRACK_GAP
}

pub fn ns_per_revolution(track: usize) -> u64 {
    60_000_000_000 / ZONE_RPM[zone(track)]
}

// 2:1 interleave: even slots count up from 0, odd slots continue from the
// midpoint.
pub fn interleave_order(sectors: usize) -> Vec<usize> {
    (0..sectors).map(|j| if j % 2 == 0 { j / 2 } else { j / 2 + (sectors + 1) / 2 }).collect()
}

// Byte offset of (track, side) in a flat image; cylinders outermost, sides
// within a cylinder.
pub fn track_image_offset(track: usize, side: usize, sides: usize) -> usize {
    let mut sectors = 0;
    for t in 0..track {
        sectors += sectors_in_track(t) * sides;
    }
    sectors += side * sectors_in_track(track);
    sectors * SECTOR_SIZE
}

// One step of the rotating three-way checksum; returns the three bytes to
// nibblize. `len` is 2 for the final short group.
struct Checksum {
    ca: u16,
    cb: u16,
    cc: u16,
}

impl Checksum {
    fn new() -> Self {
        Checksum { ca: 0, cb: 0, cc: 0 }
    }

    fn rotate(&mut self) {
        self.ca = (self.ca & 0xFF) << 1;
        if self.ca & 0x100 != 0 {
            self.ca += 1;
        }
    }

    fn encode3(&mut self, b: &[u8]) -> [u8; 3] {
        let mut out = [0u8; 3];
        self.rotate();
        self.cc += b[0] as u16;
        if self.ca & 0x100 != 0 {
            self.cc += 1;
            self.ca &= 0xFF;
        }
        out[0] = b[0] ^ self.ca as u8;
        self.cb += b[1] as u16;
        if self.cc > 0xFF {
            self.cb += 1;
            self.cc &= 0xFF;
        }
        out[1] = b[1] ^ self.cc as u8;
        if b.len() > 2 {
            self.ca += b[2] as u16;
            if self.cb > 0xFF {
                self.ca += 1;
                self.cb &= 0xFF;
            }
            out[2] = b[2] ^ self.cb as u8;
        }
        out
    }

    fn decode3(&mut self, enc: &[u8], out: &mut [u8]) {
        self.rotate();
        out[0] = enc[0] ^ self.ca as u8;
        self.cc += out[0] as u16;
        if self.ca & 0x100 != 0 {
            self.cc += 1;
            self.ca &= 0xFF;
        }
        out[1] = enc[1] ^ self.cc as u8;
        self.cb += out[1] as u16;
        if self.cc > 0xFF {
            self.cb += 1;
            self.cc &= 0xFF;
        }
        if out.len() > 2 {
            out[2] = enc[2] ^ self.cb as u8;
            self.ca += out[2] as u16;
            if self.cb > 0xFF {
                self.ca += 1;
                self.cb &= 0xFF;
            }
        }
    }

    fn nibbles(&self) -> [u8; 4] {
        let c4 = ((self.ca & 0xC0) >> 6) | ((self.cb & 0xC0) >> 4) | ((self.cc & 0xC0) >> 2);
        [c4 as u8 & 0x3F, (self.ca & 0x3F) as u8, (self.cb & 0x3F) as u8, (self.cc & 0x3F) as u8]
    }
}

fn push_group(out: &mut Vec<u8>, g: &[u8; 3], full: bool) {
    let w4 = ((g[0] & 0xC0) >> 2) | ((g[1] & 0xC0) >> 4) | ((g[2] & 0xC0) >> 6);
    out.push(GCR_TABLE[(w4 & 0x3F) as usize]);
    out.push(GCR_TABLE[(g[0] & 0x3F) as usize]);
    out.push(GCR_TABLE[(g[1] & 0x3F) as usize]);
    if full {
        out.push(GCR_TABLE[(g[2] & 0x3F) as usize]);
    }
}

fn side_bits(track: usize, side: usize) -> u8 {
    ((side as u8) << 5) | ((track >> 6) as u8)
}

fn format_byte(sides: usize) -> u8 {
    if sides == 2 {
        0x22
    } else {
        0x02
    }
}

pub fn encode_sector(
    out: &mut Vec<u8>,
    track: usize,
    side: usize,
    sector: usize,
    sides: usize,
    tag: &[u8],
    data: &[u8],
) {
    assert_eq!(tag.len(), TAG_SIZE);
    assert_eq!(data.len(), SECTOR_SIZE);
    let tk = (track & 0x3F) as u8;
    let sd = side_bits(track, side);
    let fmt = format_byte(sides);
    let sum = tk ^ sector as u8 ^ sd ^ fmt;

    // Address block.
    out.extend_from_slice(&[0xFF; 5]);
    out.extend_from_slice(&[0xD5, 0xAA, 0x96]);
    for v in [tk, sector as u8, sd, fmt, sum].iter() {
        out.push(GCR_TABLE[(v & 0x3F) as usize]);
    }
    out.extend_from_slice(&[0xDE, 0xAA, 0xFF]);

    // Data block.
    out.extend_from_slice(&[0xFF; 5]);
    out.extend_from_slice(&[0xD5, 0xAA, 0xAD]);
    out.push(GCR_TABLE[(sector & 0x3F) as usize]);
    let mut plain = [0u8; ENCODED_LEN];
    plain[..TAG_SIZE].copy_from_slice(tag);
    plain[TAG_SIZE..].copy_from_slice(data);
    let mut ck = Checksum::new();
    let mut i = 0;
    while i < ENCODED_LEN {
        let remain = ENCODED_LEN - i;
        if remain >= 3 {
            let g = ck.encode3(&plain[i..i + 3]);
            push_group(out, &g, true);
            i += 3;
        } else {
            let g = ck.encode3(&plain[i..i + 2]);
            push_group(out, &g, false);
            i += 2;
        }
    }
    let n = ck.nibbles();
    for v in n.iter() {
        out.push(GCR_TABLE[*v as usize]);
    }
    out.extend_from_slice(&[0xDE, 0xAA, 0xFF]);
}

// A whole track in physical (interleaved) order plus the speed gap.
pub fn encode_track(track: usize, side: usize, sides: usize, data: &[u8]) -> Vec<u8> {
    let sectors = sectors_in_track(track);
    assert_eq!(data.len(), sectors * SECTOR_SIZE);
    let mut out = Vec::with_capacity(track_gcr_len(track));
    let tag = [0u8; TAG_SIZE];
    for s in interleave_order(sectors) {
        encode_sector(&mut out, track, side, s, sides, &tag, &data[s * SECTOR_SIZE..(s + 1) * SECTOR_SIZE]);
    }
    out.resize(track_gcr_len(track), 0xFF);
    out
}

#[derive(Debug)]
pub struct DecodedSector {
    pub track: usize,
    pub side: usize,
    pub sector: usize,
    pub tag: [u8; TAG_SIZE],
    pub data: [u8; SECTOR_SIZE],
}

// Walk a GCR byte stream, decoding every well-formed sector. Bad address
// checksums or invalid codewords skip the sector rather than failing the
// whole track; a flush wants whatever survives.
pub fn decode_track(bytes: &[u8]) -> Vec<DecodedSector> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 3 <= bytes.len() {
        if bytes[i..i + 3] != [0xD5, 0xAA, 0x96] {
            i += 1;
            continue;
        }
        i += 3;
        if i + 5 > bytes.len() {
            break;
        }
        let mut addr = [0u8; 5];
        let mut ok = true;
        for (j, slot) in addr.iter_mut().enumerate() {
            match gcr_decode(bytes[i + j]) {
                Some(v) => *slot = v,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        i += 5;
        if !ok || addr[0] ^ addr[1] ^ addr[2] ^ addr[3] != addr[4] {
            continue;
        }
        let track = addr[0] as usize | ((addr[2] as usize & 0x01) << 6);
        let side = (addr[2] >> 5) as usize & 1;
        let sector = addr[1] as usize;
        // Find the data block for this sector.
        while i + 3 <= bytes.len() && bytes[i..i + 3] != [0xD5, 0xAA, 0xAD] {
            i += 1;
        }
        if i + 3 > bytes.len() {
            break;
        }
        i += 3;
        if i + 1 + 703 > bytes.len() {
            break;
        }
        i += 1; // sector number repeat
        let mut plain = [0u8; ENCODED_LEN];
        let mut ck = Checksum::new();
        let mut pos = 0;
        let mut bad = false;
        while pos < ENCODED_LEN {
            let full = ENCODED_LEN - pos >= 3;
            let take = if full { 4 } else { 3 };
            let mut ws = [0u8; 4];
            for j in 0..take {
                match gcr_decode(bytes[i + j]) {
                    Some(v) => ws[j] = v,
                    None => {
                        bad = true;
                        break;
                    }
                }
            }
            if bad {
                break;
            }
            i += take;
            let w4 = ws[0];
            let mut enc = [0u8; 3];
            enc[0] = ws[1] | ((w4 << 2) & 0xC0);
            enc[1] = ws[2] | ((w4 << 4) & 0xC0);
            if full {
                enc[2] = ws[3] | ((w4 << 6) & 0xC0);
                ck.decode3(&enc, &mut plain[pos..pos + 3]);
                pos += 3;
            } else {
                ck.decode3(&enc[..2], &mut plain[pos..pos + 2]);
                pos += 2;
            }
        }
        if bad {
            continue;
        }
        // Verify the checksum group.
        let expect = ck.nibbles();
        let mut sums = [0u8; 4];
        let mut sum_ok = true;
        for (j, slot) in sums.iter_mut().enumerate() {
            match gcr_decode(bytes[i + j]) {
                Some(v) => *slot = v,
                None => {
                    sum_ok = false;
                    break;
                }
            }
        }
        i += 4;
        if !sum_ok || sums != expect {
            continue;
        }
        let mut tag = [0u8; TAG_SIZE];
        let mut data = [0u8; SECTOR_SIZE];
        tag.copy_from_slice(&plain[..TAG_SIZE]);
        data.copy_from_slice(&plain[TAG_SIZE..]);
        out.push(DecodedSector { track, side, sector, tag, data });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_and_sector_counts() {
        assert_eq!(sectors_in_track(0), 12);
        assert_eq!(sectors_in_track(15), 12);
        assert_eq!(sectors_in_track(16), 11);
        assert_eq!(sectors_in_track(79), 8);
        // 400K single-sided adds up
        let total: usize = (0..TRACKS_PER_SIDE).map(sectors_in_track).sum();
        assert_eq!(total * SECTOR_SIZE, 400 * 1024);
    }

    #[test]
    fn twelve_sector_track_is_9320_bytes() {
        assert_eq!(track_gcr_len(0), 9320);
    }

    #[test]
    fn interleave_is_two_to_one() {
        assert_eq!(interleave_order(12), vec![0, 6, 1, 7, 2, 8, 3, 9, 4, 10, 5, 11]);
        assert_eq!(interleave_order(11), vec![0, 6, 1, 7, 2, 8, 3, 9, 4, 10, 5]);
        assert_eq!(interleave_order(8), vec![0, 4, 1, 5, 2, 6, 3, 7]);
    }

    #[test]
    fn sector_round_trip() {
        let tag: Vec<u8> = (0..12).collect();
        let data: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i * 7) as u8).collect();
        let mut bytes = Vec::new();
        encode_sector(&mut bytes, 70, 1, 5, 2, &tag, &data);
        assert_eq!(bytes.len(), SECTOR_GCR_BYTES);
        let decoded = decode_track(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].track, 70);
        assert_eq!(decoded[0].side, 1);
        assert_eq!(decoded[0].sector, 5);
        assert_eq!(&decoded[0].tag[..], &tag[..]);
        assert_eq!(&decoded[0].data[..], &data[..]);
    }

    #[test]
    fn all_gcr_bytes_have_the_msb_set() {
        let data = vec![0x00; SECTOR_SIZE];
        let mut bytes = Vec::new();
        encode_sector(&mut bytes, 0, 0, 0, 1, &[0; TAG_SIZE], &data);
        assert!(bytes.iter().all(|&b| b & 0x80 != 0));
    }

    #[test]
    fn track_round_trip_in_interleave_order() {
        let sectors = sectors_in_track(0);
        let data: Vec<u8> = (0..sectors * SECTOR_SIZE).map(|i| i as u8).collect();
        let track = encode_track(0, 0, 1, &data);
        assert_eq!(track.len(), 9320);
        let decoded = decode_track(&track);
        assert_eq!(decoded.len(), 12);
        let order: Vec<usize> = decoded.iter().map(|s| s.sector).collect();
        assert_eq!(order, interleave_order(12));
        for s in decoded {
            assert_eq!(&s.data[..], &data[s.sector * SECTOR_SIZE..(s.sector + 1) * SECTOR_SIZE]);
        }
    }

    #[test]
    fn image_offsets_are_cylinder_major() {
        assert_eq!(track_image_offset(0, 0, 1), 0);
        assert_eq!(track_image_offset(1, 0, 1), 12 * SECTOR_SIZE);
        assert_eq!(track_image_offset(1, 0, 2), 24 * SECTOR_SIZE);
        assert_eq!(track_image_offset(1, 1, 2), 36 * SECTOR_SIZE);
        // 800K double-sided adds up
        let total = track_image_offset(79, 1, 2) + sectors_in_track(79) * SECTOR_SIZE;
        assert_eq!(total, 800 * 1024);
    }

    #[test]
    fn corrupt_address_checksum_skips_the_sector() {
        let data = vec![0xAB; SECTOR_SIZE];
        let mut bytes = Vec::new();
        encode_sector(&mut bytes, 3, 0, 2, 1, &[0; TAG_SIZE], &data);
        bytes[9] = GCR_TABLE[0]; // clobber the encoded track number
        assert!(decode_track(&bytes).is_empty());
    }
}
