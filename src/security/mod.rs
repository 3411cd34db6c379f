pub mod secure_rng;
