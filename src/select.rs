//! Best-format selection.
//!
//! Ranks the formats a device supports against a target resolution and
//! picks the best match. The tiers are evaluated in order and the first
//! non-empty tier decides; ties within a tier break by descriptor order,
//! which makes the choice deterministic for a given device.

use crate::{desc::VideoFormat, FourCc};

/// Frame rate preferred by the exact-resolution tier.
const PREFERRED_FPS: u32 = 60;

/// Target resolution for format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Desired frame width in pixels.
    pub width: u16,
    /// Desired frame height in pixels.
    pub height: u16,
}

impl Target {
    /// Creates a selection target.
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }

    fn aspect(&self) -> (u16, u16) {
        let mut a = self.width;
        let mut b = self.height;
        while b != 0 {
            (a, b) = (b, a % b);
        }
        let g = a.max(1);
        (self.width / g, self.height / g)
    }

    fn ratio(&self) -> f32 {
        f32::from(self.width) / f32::from(self.height).max(1.0)
    }
}

/// Picks the best supported format for the given target resolution.
///
/// Only `YUY2`, `NV12` and `MJPG` formats are considered. Returns `None`
/// when no candidate remains.
pub fn best_format(formats: &[VideoFormat], target: Target) -> Option<VideoFormat> {
    let candidates: Vec<&VideoFormat> = formats
        .iter()
        .filter(|f| matches!(f.fourcc, FourCc::YUY2 | FourCc::NV12 | FourCc::MJPG))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // 1: exact resolution at the preferred frame rate
    if let Some(f) = candidates
        .iter()
        .find(|f| f.width == target.width && f.height == target.height && f.fps == PREFERRED_FPS)
    {
        return Some(**f);
    }

    // 2: exact resolution at any frame rate
    if let Some(f) = candidates.iter().find(|f| f.width == target.width && f.height == target.height) {
        return Some(**f);
    }

    // 3: same reduced aspect ratio; smallest format that still covers the
    // target area, otherwise the largest available
    let same_aspect: Vec<&&VideoFormat> =
        candidates.iter().filter(|f| f.aspect == target.aspect()).collect();
    if !same_aspect.is_empty() {
        let covering = same_aspect
            .iter()
            .filter(|f| f.area() >= target.area())
            .min_by_key(|f| f.area());
        let f = match covering {
            Some(f) => f,
            None => same_aspect.iter().max_by_key(|f| f.area()).unwrap(),
        };
        return Some(***f);
    }

    // 4: closest aspect ratio among formats at least as wide or as tall as
    // the target; prefer the smallest ratio above the target, otherwise the
    // largest ratio at or below it
    let large_enough: Vec<&&VideoFormat> = candidates
        .iter()
        .filter(|f| f.width >= target.width || f.height >= target.height)
        .collect();
    if !large_enough.is_empty() {
        let above = large_enough
            .iter()
            .filter(|f| f.ratio() > target.ratio())
            .min_by(|a, b| a.ratio().total_cmp(&b.ratio()));
        let f = match above {
            Some(f) => f,
            None => large_enough
                .iter()
                .filter(|f| f.ratio() <= target.ratio())
                .max_by(|a, b| a.ratio().total_cmp(&b.ratio()))
                .unwrap(),
        };
        return Some(***f);
    }

    // 5: closest area; largest at or below the target, otherwise smallest above
    let below = candidates
        .iter()
        .filter(|f| f.area() <= target.area())
        .max_by_key(|f| f.area());
    let f = match below {
        Some(f) => f,
        None => candidates.iter().min_by_key(|f| f.area()).unwrap(),
    };
    Some(**f)
}

#[cfg(test)]
mod test {
    use super::*;

    fn fmt(fourcc: FourCc, w: u16, h: u16, fps: u32) -> VideoFormat {
        VideoFormat::new(fourcc, w, h, fps)
    }

    #[test]
    fn exact_match_at_60_wins_over_earlier_entries() {
        let formats = [
            fmt(FourCc::MJPG, 1920, 1080, 30),
            fmt(FourCc::YUY2, 1920, 1080, 60),
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!(best, formats[1]);
    }

    #[test]
    fn exact_match_any_fps_when_no_60() {
        let formats = [
            fmt(FourCc::YUY2, 1920, 1080, 59),
            fmt(FourCc::YUY2, 1920, 1080, 30),
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!(best.fps, 59);
    }

    #[test]
    fn same_aspect_prefers_smallest_covering() {
        let formats = [
            fmt(FourCc::YUY2, 1280, 720, 60),
            fmt(FourCc::YUY2, 3840, 2160, 30),
            fmt(FourCc::YUY2, 2560, 1440, 30),
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!((best.width, best.height), (2560, 1440));
    }

    #[test]
    fn same_aspect_falls_back_to_largest() {
        let formats = [
            fmt(FourCc::YUY2, 640, 360, 30),
            fmt(FourCc::YUY2, 1280, 720, 60),
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!((best.width, best.height), (1280, 720));
    }

    #[test]
    fn closest_ratio_prefers_minimum_above() {
        let formats = [
            fmt(FourCc::YUY2, 2560, 1080, 60), // 2.37
            fmt(FourCc::YUY2, 1920, 800, 60),  // 2.4
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!((best.width, best.height), (2560, 1080));
    }

    #[test]
    fn closest_area_when_nothing_is_large_enough() {
        let formats = [
            fmt(FourCc::YUY2, 640, 480, 30),
            fmt(FourCc::NV12, 800, 600, 30),
        ];
        let best = best_format(&formats, Target::new(1920, 1080)).unwrap();
        assert_eq!((best.width, best.height), (800, 600));
    }

    #[test]
    fn unsupported_fourcc_is_not_a_candidate() {
        let formats = [fmt(FourCc(*b"H264"), 1920, 1080, 60)];
        assert_eq!(best_format(&formats, Target::new(1920, 1080)), None);
    }

    #[test]
    fn total_on_any_nonempty_candidate_list() {
        let formats = [fmt(FourCc::MJPG, 320, 240, 5)];
        for (w, h) in [(1, 1), (320, 240), (65535, 1), (1, 65535), (3840, 2160)] {
            assert!(best_format(&formats, Target::new(w, h)).is_some());
        }
    }
}
