//! Descriptor parsing and format selection against device fixtures.

mod util;

use util::*;
use uvcap::{
    desc::{AudioStreamingConnection, Descriptors, VideoStreamingConnection},
    select::{best_format, Target},
    FourCc,
};

#[test]
fn descriptor_lengths_cover_the_blob() {
    for descriptors in [ms2130(), camlink_4k(), camlink_59(), hagibis()] {
        let total: usize = descriptors.iter().map(|d| d.len()).sum();
        assert_eq!(total, descriptors.as_bytes().len());
        assert!(descriptors.iter().all(|d| d.len() >= 2));
    }
}

#[test]
fn truncated_blob_terminates_cleanly() {
    let descriptors = ms2130();
    for cut in 1..4 {
        let shortened = &descriptors.as_bytes()[..descriptors.as_bytes().len() - cut];
        let shortened = Descriptors::new(shortened.to_vec());
        // the final descriptor no longer fits; everything before it parses
        let total: usize = shortened.iter().map(|d| d.len()).sum();
        assert!(total <= shortened.as_bytes().len());
        assert!(shortened.iter().count() < descriptors.iter().count());
    }
}

#[test]
fn ms2130_formats_and_selection() {
    let descriptors = ms2130();
    let video = VideoStreamingConnection::parse(&descriptors);
    assert!(video.supports_video_streaming());
    assert_eq!(video.formats().len(), 5);
    assert_eq!(video.association().unwrap().first_interface, 0);

    let best = best_format(video.formats(), Target::new(1920, 1080)).unwrap();
    assert_eq!(
        (best.fourcc, best.width, best.height, best.fps),
        (FourCc::YUY2, 1920, 1080, 60)
    );
}

#[test]
fn camlink_4k_picks_nv12_2160p24() {
    let video = VideoStreamingConnection::parse(&camlink_4k());
    let best = best_format(video.formats(), Target::new(3840, 2160)).unwrap();
    assert_eq!(
        (best.fourcc, best.width, best.height, best.fps),
        (FourCc::NV12, 3840, 2160, 24)
    );
}

#[test]
fn camlink_variant_picks_59_when_no_60_exists() {
    let video = VideoStreamingConnection::parse(&camlink_59());
    let best = best_format(video.formats(), Target::new(1920, 1080)).unwrap();
    assert_eq!(
        (best.fourcc, best.width, best.height, best.fps),
        (FourCc::YUY2, 1920, 1080, 59)
    );
}

#[test]
fn hagibis_picks_1080p60() {
    let video = VideoStreamingConnection::parse(&hagibis());
    let best = best_format(video.formats(), Target::new(1920, 1080)).unwrap();
    assert_eq!(
        (best.fourcc, best.width, best.height, best.fps),
        (FourCc::YUY2, 1920, 1080, 60)
    );
}

#[test]
fn selector_prefers_exact_match_on_every_fixture() {
    for descriptors in [ms2130(), camlink_4k(), camlink_59(), hagibis()] {
        let video = VideoStreamingConnection::parse(&descriptors);
        for format in video.formats() {
            let target = Target::new(format.width, format.height);
            let best = best_format(video.formats(), target).unwrap();
            assert_eq!((best.width, best.height), (format.width, format.height));
        }
    }
}

#[test]
fn selector_is_total_on_fixtures() {
    let video = VideoStreamingConnection::parse(&ms2130());
    for (w, h) in [(1, 1), (640, 480), (2560, 1440), (7680, 4320), (10, 4000)] {
        assert!(best_format(video.formats(), Target::new(w, h)).is_some());
    }
}

#[test]
fn audio_connection_from_fixture() {
    let descriptors = ms2130();
    let audio = AudioStreamingConnection::parse(&descriptors);
    assert!(audio.supports_audio_streaming());
    assert!(audio.has_general());
    assert!(audio.has_format_type());
    assert_eq!(audio.sample_rate(), Some(48_000));

    let format_type = audio.format_type().unwrap();
    assert_eq!(format_type.channels, 2);
    assert_eq!(format_type.sub_frame_size, 2);
    assert_eq!(format_type.bit_resolution, 16);

    let endpoint = audio.endpoint().unwrap();
    assert_eq!(endpoint.endpoint_address, 0x84);
    assert_eq!(endpoint.max_packet_size, 0x200);
    assert!(endpoint.is_in());

    // the audio streaming interface is the one-endpoint alternate
    let interface = audio.interface().unwrap();
    assert_eq!(interface.interface_number, 3);
    assert_eq!(interface.alternate_setting, 1);
}

#[test]
fn video_records_do_not_leak_into_the_audio_walk() {
    // the video input header shares its subtype code with AS_GENERAL; the
    // audio walk must only start matching after the audio interface
    let audio = AudioStreamingConnection::parse(&ms2130());
    assert_eq!(audio.general().unwrap().format_tag, 0x0001);
}
