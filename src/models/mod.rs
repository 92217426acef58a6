pub mod booking;
pub mod email_otp;
pub mod notification;
pub mod profile;

pub use booking::{BookingPayout, PaymentStatus, TransferStatus};
pub use email_otp::{EmailOtp, NewEmailOtp};
pub use notification::NewNotification;
pub use profile::{Profile, ProfileContact, Role};
