pub mod tracking_poller;
