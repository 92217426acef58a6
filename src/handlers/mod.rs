pub mod booking;
pub mod health;
pub mod otp;
pub mod payment;
pub mod signup;

pub use booking::notify_booking_update;
pub use health::health_check;
pub use otp::{send_otp, verify_otp};
pub use payment::{initiate_payment, payment_webhook};
pub use signup::{complete_signup, confirm_user};
