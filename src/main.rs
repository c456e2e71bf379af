fn main() {
    nearcast_lib::run()
}
