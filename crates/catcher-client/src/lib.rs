pub mod fetcher;
pub mod signal;

#[cfg(feature = "browser")]
mod browser_surface;

pub use fetcher::ReqwestFetcher;
pub use signal::HttpSignalService;

#[cfg(feature = "browser")]
pub use browser_surface::BrowserSurface;
