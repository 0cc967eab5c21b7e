//! Offset arithmetic for the DMA ring buffers
//!
//! The FPGA writes samples continuously into a ring of fixed
//! size. All positions we deal with (trigger pointer, write
//! pointer, our own read position) are byte offsets into that
//! ring, so everything here is modular arithmetic.
//!
//! Getting any of these off by one silently duplicates or
//! drops samples, so they are kept tiny and heavily tested.

/// Add two offsets within a ring of `size` bytes
#[inline]
pub fn add(a : usize, b : usize, size : usize) -> usize {
  (a + b) % size
}

/// Subtract `b` from `a` within a ring of `size` bytes
///
/// The result is never negative, it is how far
/// `b` lags behind `a`.
#[inline]
pub fn sub(a : usize, b : usize, size : usize) -> usize {
  if a >= b {
    a - b
  } else {
    size + a - b
  }
}

/// Number of bytes between `from` and `to` when moving forward
#[inline]
pub fn distance(from : usize, to : usize, size : usize) -> usize {
  sub(to, from, size)
}

/// Copy `length` bytes out of a ring into a linear buffer
///
/// Starts at `ring_offset` and wraps at the end of the ring,
/// which means either one or exactly two copies. The ring size
/// is the length of `ring`.
///
/// # Arguments
///
/// * dst         : linear target, at least `length` bytes
/// * ring        : the complete ring
/// * ring_offset : where to start reading, `< ring.len()`
/// * length      : bytes to copy, `<= ring.len()`
pub fn copy_out(dst         : &mut [u8],
                ring        : &[u8],
                ring_offset : usize,
                length      : usize) {
  let ring_size = ring.len();
  if ring_offset + length <= ring_size {
    dst[..length].copy_from_slice(&ring[ring_offset..ring_offset + length]);
  } else {
    let first = ring_size - ring_offset;
    dst[..first].copy_from_slice(&ring[ring_offset..]);
    dst[first..length].copy_from_slice(&ring[..length - first]);
  }
}

#[cfg(test)]
mod test_circular {
  use super::*;
  use rand::Rng;

  #[test]
  fn sub_then_add_gives_back_the_original() {
    let mut rng = rand::thread_rng();
    for size in [1usize, 2, 7, 4096, 0x0100_0000] {
      for _ in 0..1000 {
        let a = rng.gen_range(0..size);
        let b = rng.gen_range(0..size);
        assert_eq!(add(sub(a, b, size), b, size), a);
      }
    }
  }

  #[test]
  fn distance_to_itself_is_zero() {
    for x in [0usize, 1, 4095, 8191] {
      assert_eq!(distance(x, x, 8192), 0);
    }
  }

  #[test]
  fn distance_stays_inside_the_ring() {
    let mut rng = rand::thread_rng();
    let size = 1000;
    for _ in 0..10000 {
      let from = rng.gen_range(0..size);
      let to   = rng.gen_range(0..size);
      let d    = distance(from, to, size);
      assert!(d < size);
      assert_eq!(add(from, d, size), to);
    }
  }

  #[test]
  fn distance_across_the_end() {
    assert_eq!(distance(90, 10, 100), 20);
    assert_eq!(distance(10, 90, 100), 80);
  }

  #[test]
  fn copy_out_wraps_around_the_end() {
    let size = 16usize;
    let ring : Vec<u8> = (0..size as u8).collect();
    let mut dst = vec![0u8;5];
    copy_out(&mut dst, &ring, size - 3, 5);
    assert_eq!(dst, vec![13, 14, 15, 0, 1]);
  }

  #[test]
  fn copy_out_without_wrap() {
    let ring : Vec<u8> = (0..32u8).collect();
    let mut dst = vec![0u8;8];
    copy_out(&mut dst, &ring, 4, 8);
    assert_eq!(dst, (4..12u8).collect::<Vec<u8>>());
  }

  #[test]
  fn copy_out_ending_exactly_at_the_boundary() {
    let ring : Vec<u8> = (0..32u8).collect();
    let mut dst = vec![0u8;4];
    copy_out(&mut dst, &ring, 28, 4);
    assert_eq!(dst, vec![28, 29, 30, 31]);
  }

  #[test]
  fn copy_out_the_whole_ring() {
    let ring : Vec<u8> = (0..64u8).collect();
    for offset in [0usize, 1, 33, 63] {
      let mut dst = vec![0u8;64];
      copy_out(&mut dst, &ring, offset, 64);
      for (k, byte) in dst.iter().enumerate() {
        assert_eq!(*byte as usize, (offset + k) % 64);
      }
    }
  }

  #[test]
  fn copy_out_leaves_the_rest_of_dst_alone() {
    let ring = vec![7u8;16];
    let mut dst = vec![0u8;8];
    copy_out(&mut dst, &ring, 14, 4);
    assert_eq!(dst, vec![7, 7, 7, 7, 0, 0, 0, 0]);
  }
}
