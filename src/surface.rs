//! Read-only display surfaces.
//!
//! Each surface follows a hub view and prints what it would show. None of
//! them ever writes to the collection; they only read `Arc` snapshots.

use std::time::Duration;

use rand::Rng as _;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::hub::{FeedStatus, Gallery};
use crate::photo::PhotoRecord;
use crate::types::SurfaceKind;

pub const EMPTY_MESSAGE: &str = "Waiting for photos...";

/// Slideshow position dots shown at most.
pub const MAX_DOTS: usize = 8;

pub const DEFAULT_SLIDE_INTERVAL: Duration = Duration::from_secs(4);

const BOUNCE_TICK: Duration = Duration::from_millis(100);
const SCREEN_WIDTH: i32 = 80;
const SCREEN_HEIGHT: i32 = 24;
const LOGO_WIDTH: i32 = 24;
const LOGO_HEIGHT: i32 = 6;

/// Collage tile shapes, cycled in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileShape {
    Large,
    Small,
    Tall,
    Wide,
}

const TILE_PATTERN: [TileShape; 6] = [
    TileShape::Large,
    TileShape::Small,
    TileShape::Small,
    TileShape::Tall,
    TileShape::Wide,
    TileShape::Small,
];

impl TileShape {
    pub fn for_index(index: usize) -> Self {
        TILE_PATTERN[index % TILE_PATTERN.len()]
    }

    fn as_str(&self) -> &'static str {
        match self {
            TileShape::Large => "large",
            TileShape::Small => "small",
            TileShape::Tall => "tall",
            TileShape::Wide => "wide",
        }
    }
}

/// Current slide, tracked by id so inserts ahead of it don't change what is
/// on screen.
#[derive(Debug, Default, Clone)]
pub struct Slideshow {
    index: usize,
    current: Option<String>,
}

impl Slideshow {
    /// Re-anchor on a new snapshot. Follows the current photo if it is still
    /// present, otherwise keeps the same position clamped to the new length.
    pub fn sync(&mut self, photos: &[PhotoRecord]) {
        if photos.is_empty() {
            self.index = 0;
            self.current = None;
            return;
        }
        if let Some(id) = &self.current {
            if let Some(index) = photos.iter().position(|p| &p.id == id) {
                self.index = index;
                return;
            }
        }
        self.index = self.index.min(photos.len() - 1);
        self.current = Some(photos[self.index].id.clone());
    }

    /// Move to the next slide, wrapping around. Returns false when there is
    /// nothing to advance to.
    pub fn advance(&mut self, photos: &[PhotoRecord]) -> bool {
        self.sync(photos);
        if photos.len() <= 1 {
            return false;
        }
        self.index = (self.index + 1) % photos.len();
        self.current = Some(photos[self.index].id.clone());
        true
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// `NN / NN`, 1-based.
    pub fn counter(&self, total: usize) -> String {
        format!("{:02} / {:02}", self.index + 1, total)
    }

    /// One dot per photo, capped at [`MAX_DOTS`]; the active one is filled.
    pub fn dots(&self, total: usize) -> String {
        let active = self.index % MAX_DOTS;
        (0..total.min(MAX_DOTS))
            .map(|i| if i == active { '●' } else { '·' })
            .collect()
    }
}

/// Box bouncing around a fixed screen, counting exact corner hits.
#[derive(Debug, Clone)]
pub struct Bouncer {
    x: i32,
    y: i32,
    dx: i32,
    dy: i32,
    corner_hits: u64,
}

impl Bouncer {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self::at(
            rng.gen_range(0..=SCREEN_WIDTH - LOGO_WIDTH),
            rng.gen_range(0..=SCREEN_HEIGHT - LOGO_HEIGHT),
        )
    }

    pub fn at(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            dx: 1,
            dy: 1,
            corner_hits: 0,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn corner_hits(&self) -> u64 {
        self.corner_hits
    }

    /// Advance one frame. Returns true when the box lands in a corner.
    pub fn step(&mut self) -> bool {
        self.x += self.dx;
        self.y += self.dy;

        let max_x = SCREEN_WIDTH - LOGO_WIDTH;
        let max_y = SCREEN_HEIGHT - LOGO_HEIGHT;
        if self.x >= max_x {
            self.x = max_x;
            self.dx = -self.dx;
        } else if self.x <= 0 {
            self.x = 0;
            self.dx = -self.dx;
        }
        if self.y >= max_y {
            self.y = max_y;
            self.dy = -self.dy;
        } else if self.y <= 0 {
            self.y = 0;
            self.dy = -self.dy;
        }

        let corner = (self.x == 0 || self.x == max_x) && (self.y == 0 || self.y == max_y);
        if corner {
            self.corner_hits += 1;
        }
        corner
    }
}

impl Default for Bouncer {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(photo: &PhotoRecord) -> String {
    format!(
        "{}  {:<7}  {}  {}",
        photo.created_at.format("%Y-%m-%d %H:%M:%S"),
        photo.device_type,
        photo.id,
        photo.file_url
    )
}

pub fn render_gallery(photos: &[PhotoRecord]) -> Vec<String> {
    if photos.is_empty() {
        return vec![EMPTY_MESSAGE.to_string()];
    }
    let mut lines = vec![format!("{} photos", photos.len())];
    lines.extend(photos.iter().map(describe));
    lines
}

pub fn render_collage(photos: &[PhotoRecord]) -> Vec<String> {
    if photos.is_empty() {
        return vec![EMPTY_MESSAGE.to_string()];
    }
    photos
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{:<5}] {}  {}", TileShape::for_index(i).as_str(), p.id, p.file_url))
        .collect()
}

pub fn render_slide(slideshow: &Slideshow, photos: &[PhotoRecord]) -> Vec<String> {
    let Some(photo) = photos.get(slideshow.index()) else {
        return vec![EMPTY_MESSAGE.to_string()];
    };
    vec![
        format!("{}  {}", slideshow.counter(photos.len()), describe(photo)),
        slideshow.dots(photos.len()),
    ]
}

pub fn render_screensaver(bouncer: &Bouncer, photos: &[PhotoRecord]) -> Vec<String> {
    let (x, y) = bouncer.position();
    let caption = photos
        .first()
        .map(|p| format!("latest {}", p.id))
        .unwrap_or_else(|| EMPTY_MESSAGE.to_string());
    vec![format!(
        "logo at ({x:>2}, {y:>2})  corners {}  {caption}",
        bouncer.corner_hits()
    )]
}

fn status_line(status: &FeedStatus) -> Option<String> {
    match status {
        FeedStatus::Connecting => Some("Connecting...".to_string()),
        FeedStatus::Live => None,
        FeedStatus::Failed(message) => Some(format!("Could not load photos: {message}")),
        FeedStatus::Disconnected(message) => {
            Some(format!("Live updates interrupted: {message}"))
        }
        FeedStatus::Closed => Some("Closed".to_string()),
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// Follow `view` until `token` is cancelled or the hub closes, printing
/// each frame.
pub async fn run_surface(
    kind: SurfaceKind,
    mut view: watch::Receiver<Gallery>,
    token: CancellationToken,
    slide_interval: Duration,
) {
    let mut slideshow = Slideshow::default();
    let mut bouncer = Bouncer::new();
    let animated = matches!(kind, SurfaceKind::Slideshow | SurfaceKind::Screensaver);
    let period = match kind {
        SurfaceKind::Screensaver => BOUNCE_TICK,
        _ => slide_interval,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    let mut gallery = view.borrow_and_update().clone();
    let mut shown_status = None;

    tracing::info!(surface = ?kind, "Surface started");
    loop {
        if shown_status.as_ref() != Some(&gallery.status) {
            if let Some(line) = status_line(&gallery.status) {
                println!("{line}");
            }
            shown_status = Some(gallery.status.clone());
        }
        if gallery.status == FeedStatus::Closed {
            break;
        }

        let lines = match kind {
            SurfaceKind::Gallery => render_gallery(&gallery.photos),
            SurfaceKind::Collage => render_collage(&gallery.photos),
            SurfaceKind::Slideshow => {
                slideshow.sync(&gallery.photos);
                render_slide(&slideshow, &gallery.photos)
            }
            SurfaceKind::Screensaver => render_screensaver(&bouncer, &gallery.photos),
        };
        print_lines(&lines);

        // Wait for the next frame: a new snapshot, or a tick for the
        // animated surfaces. Ticks that change nothing print nothing.
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(surface = ?kind, "Surface stopped");
                    return;
                }
                changed = view.changed() => {
                    if changed.is_err() {
                        tracing::info!(surface = ?kind, "Photo feed gone, surface stopped");
                        return;
                    }
                    gallery = view.borrow_and_update().clone();
                    break;
                }
                _ = ticker.tick(), if animated => {
                    match kind {
                        SurfaceKind::Slideshow if slideshow.advance(&gallery.photos) => {
                            print_lines(&render_slide(&slideshow, &gallery.photos));
                        }
                        SurfaceKind::Screensaver if bouncer.step() => {
                            print_lines(&render_screensaver(&bouncer, &gallery.photos));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    tracing::info!(surface = ?kind, "Surface stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::tests::photo;
    use std::sync::Arc;

    #[test]
    fn test_slideshow_wraps() {
        let photos = vec![photo("c", 3), photo("b", 2), photo("a", 1)];
        let mut show = Slideshow::default();
        show.sync(&photos);
        assert_eq!(show.current(), Some("c"));

        assert!(show.advance(&photos));
        assert!(show.advance(&photos));
        assert_eq!(show.current(), Some("a"));
        assert!(show.advance(&photos));
        assert_eq!(show.current(), Some("c"));
        assert_eq!(show.index(), 0);
    }

    #[test]
    fn test_slideshow_single_photo_does_not_advance() {
        let photos = vec![photo("a", 1)];
        let mut show = Slideshow::default();
        assert!(!show.advance(&photos));
        assert_eq!(show.current(), Some("a"));
        assert!(!show.advance(&[]));
        assert_eq!(show.current(), None);
    }

    #[test]
    fn test_slideshow_follows_current_photo_across_inserts() {
        let mut photos = vec![photo("b", 2), photo("a", 1)];
        let mut show = Slideshow::default();
        show.sync(&photos);
        show.advance(&photos);
        assert_eq!(show.current(), Some("a"));

        photos.insert(0, photo("new", 9));
        show.sync(&photos);
        assert_eq!(show.current(), Some("a"));
        assert_eq!(show.index(), 2);
    }

    #[test]
    fn test_slideshow_clamps_when_current_deleted() {
        let photos = vec![photo("c", 3), photo("b", 2), photo("a", 1)];
        let mut show = Slideshow::default();
        show.sync(&photos);
        show.advance(&photos);
        show.advance(&photos);
        assert_eq!(show.current(), Some("a"));

        let remaining = vec![photo("c", 3), photo("b", 2)];
        show.sync(&remaining);
        assert_eq!(show.index(), 1);
        assert_eq!(show.current(), Some("b"));
    }

    #[test]
    fn test_slideshow_counter_and_dots() {
        let photos: Vec<_> = (0..10).map(|i| photo(&format!("p{i}"), 10 - i)).collect();
        let mut show = Slideshow::default();
        show.sync(&photos);
        for _ in 0..9 {
            show.advance(&photos);
        }
        assert_eq!(show.counter(photos.len()), "10 / 10");
        assert_eq!(show.dots(photos.len()), "·●······");
        assert_eq!(show.dots(3).chars().count(), 3);
    }

    #[test]
    fn test_collage_cycles_tile_shapes() {
        let shapes: Vec<_> = (0..8).map(TileShape::for_index).collect();
        assert_eq!(
            shapes,
            vec![
                TileShape::Large,
                TileShape::Small,
                TileShape::Small,
                TileShape::Tall,
                TileShape::Wide,
                TileShape::Small,
                TileShape::Large,
                TileShape::Small,
            ]
        );
        let lines = render_collage(&[photo("x", 1)]);
        assert!(lines[0].starts_with("[large] x"));
    }

    #[test]
    fn test_empty_surfaces_show_waiting_message() {
        assert_eq!(render_gallery(&[]), vec![EMPTY_MESSAGE]);
        assert_eq!(render_collage(&[]), vec![EMPTY_MESSAGE]);
        assert_eq!(render_slide(&Slideshow::default(), &[]), vec![EMPTY_MESSAGE]);
    }

    #[test]
    fn test_gallery_lists_newest_first() {
        let lines = render_gallery(&[photo("b", 2), photo("a", 1)]);
        assert_eq!(lines[0], "2 photos");
        assert!(lines[1].contains(" b "));
        assert!(lines[2].contains(" a "));
    }

    #[test]
    fn test_bouncer_stays_on_screen_and_counts_corners() {
        let mut bouncer = Bouncer::at(0, 0);
        let max_x = SCREEN_WIDTH - LOGO_WIDTH;
        let max_y = SCREEN_HEIGHT - LOGO_HEIGHT;
        for _ in 0..10_000 {
            bouncer.step();
            let (x, y) = bouncer.position();
            assert!((0..=max_x).contains(&x));
            assert!((0..=max_y).contains(&y));
        }
        assert!(bouncer.corner_hits() > 0);
    }

    #[test]
    fn test_bouncer_reports_exact_corner() {
        let max_x = SCREEN_WIDTH - LOGO_WIDTH;
        let max_y = SCREEN_HEIGHT - LOGO_HEIGHT;
        let mut bouncer = Bouncer::at(max_x - 1, max_y - 1);
        assert!(bouncer.step());
        assert_eq!(bouncer.position(), (max_x, max_y));
        assert!(!bouncer.step());
        assert_eq!(bouncer.corner_hits(), 1);
    }

    #[tokio::test]
    async fn test_run_surface_stops_when_hub_closes() {
        let (tx, rx) = watch::channel(Gallery {
            photos: Arc::from(vec![photo("a", 1)]),
            status: FeedStatus::Live,
        });
        let surface = tokio::spawn(run_surface(
            SurfaceKind::Slideshow,
            rx,
            CancellationToken::new(),
            Duration::from_millis(5),
        ));

        tx.send_replace(Gallery {
            photos: Arc::from(vec![photo("b", 2), photo("a", 1)]),
            status: FeedStatus::Live,
        });
        tx.send_replace(Gallery {
            photos: Arc::from(Vec::new()),
            status: FeedStatus::Closed,
        });
        tokio::time::timeout(Duration::from_secs(2), surface)
            .await
            .expect("surface stops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_surface_stops_on_cancel() {
        let (_tx, rx) = watch::channel(Gallery {
            photos: Arc::from(Vec::new()),
            status: FeedStatus::Connecting,
        });
        let token = CancellationToken::new();
        let surface = tokio::spawn(run_surface(
            SurfaceKind::Screensaver,
            rx,
            token.clone(),
            DEFAULT_SLIDE_INTERVAL,
        ));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), surface)
            .await
            .expect("surface stops")
            .unwrap();
    }
}
