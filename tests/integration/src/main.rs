mod helpers;

mod cluster;
mod coord;
