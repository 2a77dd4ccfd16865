use std::{thread, time::Duration};

/// Opens `url` in the default browser on a detached thread, after a
/// short delay so the listener is accepting by the time the browser
/// connects. Failure is cosmetic and deliberately unreported.
pub fn open_delayed(url: String) {
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        let _ = open::that(url);
    });
}
