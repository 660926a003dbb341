// Classification dispatch over a fixed pool of GPU slots

pub mod dispatcher;
pub mod invoke;
pub mod slots;
