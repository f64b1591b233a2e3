pub mod api;
pub mod capture;

pub fn init_logging() {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Debug)
                .with_tag("waste_scan_rust"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        // host apps and tests install their own logger
    }
}
