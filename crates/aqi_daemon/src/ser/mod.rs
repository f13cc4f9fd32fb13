pub mod calendar_date;
pub mod utc_datetime;
