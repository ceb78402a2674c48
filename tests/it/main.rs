mod harness;

mod recovery;
mod scheduling;
mod surface;
