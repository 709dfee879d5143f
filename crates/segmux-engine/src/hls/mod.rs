pub mod playlist;

pub use playlist::{
    ByteRange, MediaPlaylist, Segment, Variant, best_variant, parse_media_playlist,
    parse_variants, select_variant,
};
