//! Tile keys and invalidation regions.

use lool_common::protocol::{token_int, tokenize};

/// Identity of a rendered tile.
///
/// `width`/`height` are the pixel dimensions of the rendering; the
/// `tile_pos_*`/`tile_*` fields are the covered rectangle in document
/// coordinates (twips).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
}

impl TileKey {
    /// The document-coordinate rectangle this tile covers.
    pub fn rect(&self) -> Rect {
        Rect {
            x: self.tile_pos_x,
            y: self.tile_pos_y,
            width: self.tile_width,
            height: self.tile_height,
        }
    }
}

/// An axis-aligned rectangle in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    /// Edge-inclusive intersection test: rectangles that merely touch count
    /// as intersecting.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.x + other.width
            && other.x <= self.x + self.width
            && self.y <= other.y + other.height
            && other.y <= self.y + self.height
    }
}

/// An invalidation region scoped to a part, or to every part when `part` is
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRect {
    pub part: Option<i32>,
    pub rect: Rect,
}

impl PartRect {
    /// Whether a stored tile falls inside this region.
    pub fn covers(&self, key: &TileKey) -> bool {
        match self.part {
            Some(part) if part != key.part => false,
            _ => self.rect.intersects(&key.rect()),
        }
    }
}

/// A parsed `invalidatetiles:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Whole-document invalidation: drop every tile for every part.
    All,
    /// One or more rectangles.
    Rects(Vec<PartRect>),
}

impl Invalidation {
    /// Parses the engine's free-form textual invalidation.
    ///
    /// Accepted shapes, with or without the leading `invalidatetiles:`
    /// prefix:
    ///
    /// - `EMPTY` - the whole document.
    /// - `part=P x=X y=Y width=W height=H` - one keyed rectangle.
    /// - `X, Y, W, H` - comma-separated bare coordinates, applying to every
    ///   part.
    ///
    /// Anything unparseable degrades to [`Invalidation::All`]: over-dropping
    /// is always safe, serving a stale tile is not.
    pub fn parse(raw: &str) -> Invalidation {
        let body = raw
            .trim()
            .strip_prefix("invalidatetiles:")
            .unwrap_or(raw)
            .trim();

        if body.is_empty() || body.contains("EMPTY") {
            return Invalidation::All;
        }

        if body.contains('=') {
            let tokens = tokenize(body);
            let part = tokens.iter().find_map(|t| token_int(t, "part"));
            let x = tokens.iter().find_map(|t| token_int(t, "x"));
            let y = tokens.iter().find_map(|t| token_int(t, "y"));
            let width = tokens.iter().find_map(|t| token_int(t, "width"));
            let height = tokens.iter().find_map(|t| token_int(t, "height"));
            return match (x, y, width, height) {
                (Some(x), Some(y), Some(width), Some(height)) => {
                    Invalidation::Rects(vec![PartRect {
                        part: part.map(|p| p as i32),
                        rect: Rect {
                            x: x as i32,
                            y: y as i32,
                            width: width as i32,
                            height: height as i32,
                        },
                    }])
                }
                _ => Invalidation::All,
            };
        }

        // Bare coordinate list: groups of four integers.
        let numbers: Vec<i32> = body
            .split([',', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .unwrap_or_default();
        if numbers.is_empty() || numbers.len() % 4 != 0 {
            return Invalidation::All;
        }

        Invalidation::Rects(
            numbers
                .chunks_exact(4)
                .map(|c| PartRect {
                    part: None,
                    rect: Rect {
                        x: c[0],
                        y: c[1],
                        width: c[2],
                        height: c[3],
                    },
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(part: i32, x: i32, y: i32) -> TileKey {
        TileKey {
            part,
            width: 256,
            height: 256,
            tile_pos_x: x,
            tile_pos_y: y,
            tile_width: 3840,
            tile_height: 3840,
        }
    }

    #[test]
    fn test_rect_intersection_is_edge_inclusive() {
        let a = Rect { x: 0, y: 0, width: 100, height: 100 };
        let touching = Rect { x: 100, y: 0, width: 50, height: 50 };
        let apart = Rect { x: 101, y: 0, width: 50, height: 50 };
        assert!(a.intersects(&touching));
        assert!(touching.intersects(&a));
        assert!(!a.intersects(&apart));
    }

    #[test]
    fn test_parse_empty_sentinel() {
        assert_eq!(Invalidation::parse("invalidatetiles: EMPTY"), Invalidation::All);
        assert_eq!(Invalidation::parse("EMPTY"), Invalidation::All);
    }

    #[test]
    fn test_parse_keyed_rectangle() {
        let inv = Invalidation::parse("invalidatetiles: part=0 x=0 y=0 width=5000 height=5000");
        let Invalidation::Rects(rects) = inv else {
            panic!("expected rectangles");
        };
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0].part, Some(0));
        assert_eq!(rects[0].rect, Rect { x: 0, y: 0, width: 5000, height: 5000 });
        assert!(rects[0].covers(&key(0, 0, 0)));
        assert!(!rects[0].covers(&key(1, 0, 0)));
        assert!(!rects[0].covers(&key(0, 9000, 9000)));
    }

    #[test]
    fn test_parse_bare_coordinate_list() {
        let inv = Invalidation::parse("invalidatetiles: 0, 0, 10240, 2560");
        let Invalidation::Rects(rects) = inv else {
            panic!("expected rectangles");
        };
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0].part, None);
        assert!(rects[0].covers(&key(0, 0, 0)));
        assert!(rects[0].covers(&key(3, 0, 0)), "bare rect applies to every part");
    }

    #[test]
    fn test_parse_garbage_degrades_to_all() {
        assert_eq!(Invalidation::parse("invalidatetiles: what"), Invalidation::All);
        assert_eq!(Invalidation::parse("invalidatetiles: 1, 2, 3"), Invalidation::All);
    }

    #[test]
    fn test_tile_key_rect() {
        let k = key(0, 3840, 7680);
        assert_eq!(k.rect(), Rect { x: 3840, y: 7680, width: 3840, height: 3840 });
    }
}
