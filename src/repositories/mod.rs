pub mod booking;
pub mod email_otp;
pub mod notification;
pub mod profile;

pub use booking::BookingRepository;
pub use email_otp::EmailOtpRepository;
pub use notification::NotificationRepository;
pub use profile::{ProfileFields, ProfileRepository};
